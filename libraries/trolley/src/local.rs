//! Device-local cart persistence over `window.localStorage`.
//!
//! The cart is one small value, so it gets one well-known key and a
//! synchronous whole-value write on every mutation. Losing a write here is
//! non-fatal (the in-memory cart stays authoritative for the session), so
//! callers log failures and move on; a stored value that no longer parses
//! is treated the same as no stored value at all.

#[cfg(target_arch = "wasm32")]
use crate::Cart;

pub const CART_STORAGE_KEY: &str = "tienda.cart.v1";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("localStorage is unavailable")]
    StorageUnavailable,
    #[error("storage operation failed: {0}")]
    Storage(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[cfg(target_arch = "wasm32")]
fn storage() -> Result<web_sys::Storage, StoreError> {
    web_sys::window()
        .and_then(|window| window.local_storage().ok().flatten())
        .ok_or(StoreError::StorageUnavailable)
}

/// Read the persisted cart. Absent, unreadable, and corrupt values all come
/// back as an empty cart.
#[cfg(target_arch = "wasm32")]
pub fn load() -> Cart {
    let storage = match storage() {
        Ok(storage) => storage,
        Err(e) => {
            log::warn!("Cart load skipped: {e}");
            return Cart::default();
        }
    };

    let raw = match storage.get_item(CART_STORAGE_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Cart::default(),
        Err(e) => {
            log::warn!("Cart load failed: {e:?}");
            return Cart::default();
        }
    };

    match Cart::from_json(&raw) {
        Ok(cart) => cart,
        Err(e) => {
            log::warn!("Stored cart did not parse, starting empty: {e}");
            Cart::default()
        }
    }
}

/// Overwrite the persisted cart unconditionally.
#[cfg(target_arch = "wasm32")]
pub fn save(cart: &Cart) -> Result<(), StoreError> {
    let storage = storage()?;
    let raw = cart.to_json()?;
    storage
        .set_item(CART_STORAGE_KEY, &raw)
        .map_err(|e| StoreError::Storage(format!("{e:?}")))
}
