//! The single owned home of the in-memory cart. The UI never touches the
//! cart value directly; it goes through the mutation methods here, which
//! keep the change counter and the listener notifications honest.

use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use slotmap::SlotMap;

use crate::{Cart, ProductSnapshot};

slotmap::new_key_type! {
    pub struct ListenerKey;
}

/// The places a cart can be pushed to or pulled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "tsify", derive(tsify::Tsify))]
#[cfg_attr(feature = "tsify", tsify(into_wasm_abi, from_wasm_abi))]
pub enum SyncTarget {
    LocalStorage,
    Supabase,
}

/// Bookkeeping for the last sync attempt against one target. Read-only for
/// the UI; useful for a "saving…" indicator and for debugging sync issues
/// in the field.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "tsify", derive(tsify::Tsify))]
#[cfg_attr(feature = "tsify", tsify(into_wasm_abi, from_wasm_abi))]
pub struct SyncState {
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

pub struct CartStore {
    cart: Cart,
    loaded: bool,
    rev: u64,
    dirty: bool,
    listeners: SlotMap<ListenerKey, Rc<dyn Fn()>>,
    sync: BTreeMap<SyncTarget, SyncState>,
}

impl Default for CartStore {
    fn default() -> Self {
        Self {
            cart: Cart::default(),
            loaded: false,
            rev: 0,
            dirty: false,
            listeners: SlotMap::with_key(),
            sync: BTreeMap::new(),
        }
    }
}

impl CartStore {
    pub fn cart(&self) -> &Cart {
        &self.cart
    }

    /// Distinguishes "genuinely empty" from "not loaded from disk yet".
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn mark_loaded(&mut self) {
        if !self.loaded {
            self.loaded = true;
            self.dirty = true;
        }
    }

    /// Bumped on every cart change; lets callers detect mutations that
    /// happened while they were suspended on a network call.
    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn add(&mut self, snapshot: ProductSnapshot) {
        self.cart.add(snapshot);
        self.mark_changed();
    }

    pub fn remove(&mut self, product_id: &str) {
        if self.cart.remove(product_id) {
            self.mark_changed();
        }
    }

    pub fn set_quantity(&mut self, product_id: &str, quantity: i32) {
        if self.cart.set_quantity(product_id, quantity) {
            self.mark_changed();
        }
    }

    pub fn clear(&mut self) {
        if self.cart.clear() {
            self.mark_changed();
        }
    }

    /// Swap in a merged cart wholesale (sign-in merge outcome).
    pub fn replace_cart(&mut self, cart: Cart) {
        self.cart = cart;
        self.mark_changed();
    }

    fn mark_changed(&mut self) {
        self.rev += 1;
        self.dirty = true;
    }

    pub fn register_listener(&mut self, listener: Rc<dyn Fn()>) -> ListenerKey {
        self.listeners.insert(listener)
    }

    pub fn unregister_listener(&mut self, key: ListenerKey) {
        self.listeners.remove(key);
    }

    /// Collect the callbacks that are due, clearing the dirty flag. The
    /// caller invokes them *after* releasing its borrow of the store, since
    /// listeners routinely call straight back into it.
    pub fn drain_due_notifications(&mut self) -> Vec<Rc<dyn Fn()>> {
        if !self.dirty {
            return Vec::new();
        }
        self.dirty = false;
        self.listeners.values().cloned().collect()
    }

    pub fn mark_sync_started(&mut self, target: SyncTarget) {
        let state = self.sync.entry(target).or_default();
        state.in_flight = true;
    }

    pub fn mark_sync_finished(&mut self, target: SyncTarget, error: Option<String>) {
        let state = self.sync.entry(target).or_default();
        state.in_flight = false;
        state.last_error = error;
        state.last_finished_at = Some(Utc::now());
    }

    pub fn sync_state(&self, target: SyncTarget) -> Option<&SyncState> {
        self.sync.get(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn snapshot(product_id: &str) -> ProductSnapshot {
        ProductSnapshot {
            product_id: product_id.to_string(),
            name: product_id.to_string(),
            price_cents: 500,
            image_url: None,
            quantity: 1,
        }
    }

    #[test]
    fn mutations_bump_rev_and_noops_do_not() {
        let mut store = CartStore::default();
        store.add(snapshot("a"));
        assert_eq!(store.rev(), 1);
        store.set_quantity("a", 3);
        assert_eq!(store.rev(), 2);
        // Removing something absent changes nothing.
        store.remove("missing");
        assert_eq!(store.rev(), 2);
        store.clear();
        assert_eq!(store.rev(), 3);
        store.clear();
        assert_eq!(store.rev(), 3);
    }

    #[test]
    fn listeners_fire_once_per_drain() {
        let mut store = CartStore::default();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        store.register_listener(Rc::new(move || counter.set(counter.get() + 1)));

        store.add(snapshot("a"));
        store.add(snapshot("b"));
        for listener in store.drain_due_notifications() {
            listener();
        }
        assert_eq!(calls.get(), 1);

        // Nothing changed since the last drain.
        assert!(store.drain_due_notifications().is_empty());
    }

    #[test]
    fn unregistered_listeners_stop_firing() {
        let mut store = CartStore::default();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let key = store.register_listener(Rc::new(move || counter.set(counter.get() + 1)));
        store.unregister_listener(key);

        store.add(snapshot("a"));
        for listener in store.drain_due_notifications() {
            listener();
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn loaded_flag_flips_once_and_notifies() {
        let mut store = CartStore::default();
        assert!(!store.loaded());
        store.mark_loaded();
        assert!(store.loaded());
        assert_eq!(store.drain_due_notifications().len(), 0); // no listeners yet
        store.mark_loaded();
        assert!(store.drain_due_notifications().is_empty());
    }

    #[test]
    fn sync_lifecycle_is_recorded() {
        let mut store = CartStore::default();
        assert!(store.sync_state(SyncTarget::Supabase).is_none());

        store.mark_sync_started(SyncTarget::Supabase);
        assert!(store.sync_state(SyncTarget::Supabase).unwrap().in_flight);

        store.mark_sync_finished(SyncTarget::Supabase, Some("boom".to_string()));
        let state = store.sync_state(SyncTarget::Supabase).unwrap();
        assert!(!state.in_flight);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(state.last_finished_at.is_some());

        store.mark_sync_finished(SyncTarget::Supabase, None);
        let state = store.sync_state(SyncTarget::Supabase).unwrap();
        assert_eq!(state.last_error, None);
    }
}
