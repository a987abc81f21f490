//! Utilities for mirroring the cart into a Supabase database.
//!
//! One row per user in the `carts` table: `user_id` plus a JSON `payload`
//! column holding a [`crate::VersionedCartSnapshot`]. Every write replaces
//! the whole payload (`on_conflict=user_id` upsert), so consistency is
//! plain last-write-wins on the document and no line-level locking exists
//! anywhere.

use std::cell::RefCell;

use wasm_bindgen::JsValue;

use crate::store::{CartStore, SyncTarget};
use crate::{Cart, VersionedCartSnapshot};

#[derive(serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

#[derive(serde::Deserialize)]
struct CartRow {
    payload: VersionedCartSnapshot,
}

/// Fetch the user's cart row. `Ok(None)` is the expected outcome for a user
/// who has never synced; only transport and decode problems are errors.
pub async fn fetch_remote_cart(
    config: &SupabaseConfig,
    access_token: &str,
    user_id: &str,
) -> Result<Option<Cart>, JsValue> {
    use fetch_happen::Client;

    let SupabaseConfig {
        supabase_url,
        supabase_anon_key,
    } = config;

    let url = format!("{supabase_url}/rest/v1/carts?user_id=eq.{user_id}&select=payload");

    let client = Client;
    let response = client
        .get(&url)
        .header("apikey", supabase_anon_key)
        .header("Authorization", format!("Bearer {access_token}"))
        .send()
        .await
        .map_err(|e| JsValue::from_str(&format!("{e:?}")))?;

    if !response.ok() {
        return Err(JsValue::from_str(&format!(
            "Cart fetch failed with status: {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| JsValue::from_str(&format!("{e:?}")))?;

    let rows: Vec<CartRow> = serde_json::from_str(&body).map_err(|e| {
        JsValue::from_str(&format!(
            "Failed to parse cart row: {e}\nResponse body: {body}"
        ))
    })?;

    Ok(rows
        .into_iter()
        .next()
        .map(|row| Cart::from_snapshot(row.payload)))
}

/// Replace the user's cart row with the given cart. Idempotent; sending the
/// same cart twice leaves the row identical.
pub async fn upsert_remote_cart(
    config: &SupabaseConfig,
    access_token: &str,
    user_id: &str,
    cart: &Cart,
) -> Result<(), JsValue> {
    use fetch_happen::Client;
    use serde_json::json;

    let SupabaseConfig {
        supabase_url,
        supabase_anon_key,
    } = config;

    let url = format!("{supabase_url}/rest/v1/carts?on_conflict=user_id");
    let row = json!({
        "user_id": user_id,
        "payload": cart.to_snapshot(),
    });

    let client = Client;
    let response = client
        .post(&url)
        .header("apikey", supabase_anon_key)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Prefer", "resolution=merge-duplicates")
        .json(&row)
        .map_err(|e| JsValue::from_str(&format!("{e:?}")))?
        .send()
        .await
        .map_err(|e| JsValue::from_str(&format!("{e:?}")))?;

    if !response.ok() {
        let status = response.status();
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(JsValue::from_str(&format!(
            "Cart upsert failed: {status} - {error_body}"
        )));
    }

    Ok(())
}

/// Push the cart to the server, recording the attempt on the store.
///
/// The cart is read from the store at send time, after the lifecycle mark,
/// so the payload always reflects the latest state rather than whatever was
/// current when the caller decided to sync. The store borrow is never held
/// across the await.
pub async fn sync_cart_with_supabase(
    store: &RefCell<CartStore>,
    config: &SupabaseConfig,
    access_token: &str,
    user_id: &str,
) -> Result<(), JsValue> {
    store.borrow_mut().mark_sync_started(SyncTarget::Supabase);

    let cart = store.borrow().cart().clone();

    match upsert_remote_cart(config, access_token, user_id, &cart).await {
        Ok(()) => {
            store
                .borrow_mut()
                .mark_sync_finished(SyncTarget::Supabase, None);
            Ok(())
        }
        Err(e) => {
            let msg = e.as_string().unwrap_or_else(|| format!("{e:?}"));
            log::error!("Failed to push cart: {msg}");
            store
                .borrow_mut()
                .mark_sync_finished(SyncTarget::Supabase, Some(msg));
            Err(e)
        }
    }
}
