#![deny(clippy::string_slice)]

mod auth;
mod checkout;
mod supabase;
mod utils;

pub use auth::{AuthEvent, Session};
pub use checkout::{CheckoutRedirect, ShippingDetails};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::LazyLock;

use trolley::gate::{DebounceGate, MergeGate};
use trolley::store::{CartStore, ListenerKey, SyncState, SyncTarget};
use trolley::{Cart, CartLine, MergeReport, ProductSnapshot};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// How long the cart has to sit still before its state is pushed to the
/// server. Rapid quantity clicks coalesce into one write.
#[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
const DEBOUNCE_WINDOW_MS: i32 = 500;

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
static LOGGER: LazyLock<()> = LazyLock::new(|| {
    utils::set_panic_hook();

    #[cfg(target_arch = "wasm32")]
    {
        wasm_logger::init(wasm_logger::Config::default());
        log::info!("Logging initialized");
    }
});

/// The cart subsystem, as handed to the JS UI. One instance per page; the
/// UI mutates the cart only through the methods here and re-renders off the
/// subscription callbacks.
///
/// We should never hold a store borrow across an .await. By avoiding this,
/// we guarantee the absence of "borrow while locked" panics.
#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
pub struct Trolley {
    pub(crate) inner: Rc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) store: RefCell<CartStore>,
    pub(crate) session: RefCell<Option<Session>>,
    merge_gate: MergeGate,
    debounce: DebounceGate,
    timer: SyncTimer,
    role: RefCell<Option<String>>,
    role_generation: Cell<u64>,
}

/// Handle returned by `subscribe`; pass it back to `unsubscribe`.
#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
pub struct Subscription {
    key: ListenerKey,
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Trolley {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(constructor))]
    pub fn new() -> Trolley {
        let _ = *LOGGER;

        let trolley = Trolley {
            inner: Rc::new(Inner {
                store: RefCell::new(CartStore::default()),
                session: RefCell::new(None),
                merge_gate: MergeGate::default(),
                debounce: DebounceGate::default(),
                timer: SyncTimer::default(),
                role: RefCell::new(None),
                role_generation: Cell::new(0),
            }),
        };

        {
            let mut store = trolley.inner.store.borrow_mut();
            #[cfg(target_arch = "wasm32")]
            store.replace_cart(trolley::local::load());
            store.mark_loaded();
        }

        trolley
    }

    // =======
    // mutations
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn add(&self, product: ProductSnapshot) {
        let _flusher = FlushLater::new(self);
        self.inner.store.borrow_mut().add(product);
        Inner::after_mutation(&self.inner);
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn remove(&self, product_id: String) {
        let _flusher = FlushLater::new(self);
        self.inner.store.borrow_mut().remove(&product_id);
        Inner::after_mutation(&self.inner);
    }

    /// Zero and negative quantities behave exactly like `remove`.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn set_quantity(&self, product_id: String, quantity: i32) {
        let _flusher = FlushLater::new(self);
        self.inner
            .store
            .borrow_mut()
            .set_quantity(&product_id, quantity);
        Inner::after_mutation(&self.inner);
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn clear(&self) {
        let _flusher = FlushLater::new(self);
        self.inner.store.borrow_mut().clear();
        Inner::after_mutation(&self.inner);
    }

    // =======
    // reads
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn current_cart(&self) -> Vec<CartLine> {
        self.inner.store.borrow().cart().iter().cloned().collect()
    }

    /// Total units across all lines; what the cart badge shows.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn item_count(&self) -> u32 {
        self.inner.store.borrow().cart().item_count()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn distinct_lines(&self) -> usize {
        self.inner.store.borrow().cart().distinct_lines()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn total_cents(&self) -> f64 {
        self.inner.store.borrow().cart().total_cents() as f64
    }

    /// False until the first load from local storage has happened; lets the
    /// UI tell "empty cart" apart from "cart not read yet".
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn initialized(&self) -> bool {
        self.inner.store.borrow().loaded()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn user_id(&self) -> Option<String> {
        self.inner
            .session
            .borrow()
            .as_ref()
            .map(|session| session.user_id.clone())
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn is_admin(&self) -> bool {
        matches!(self.inner.role.borrow().as_deref(), Some("admin"))
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn sync_state(&self, target: SyncTarget) -> SyncState {
        self.inner
            .store
            .borrow()
            .sync_state(target)
            .cloned()
            .unwrap_or_default()
    }

    // =======
    // subscriptions
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn subscribe(&self, callback: js_sys::Function) -> Subscription {
        let key = self
            .inner
            .store
            .borrow_mut()
            .register_listener(Rc::new(move || {
                let this = JsValue::null();
                let _ = callback.call0(&this);
            }));
        Subscription { key }
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner
            .store
            .borrow_mut()
            .unregister_listener(subscription.key);
    }

    // =======
    // auth
    // =======

    /// Entry point for every auth transition the JS host observes,
    /// including the startup "current session" query. Returns a merge
    /// report when a sign-in merge ran to completion; the UI shows its
    /// "carts combined" notice only when `true_merge` is set.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn handle_auth_event(&self, event: AuthEvent) -> Option<MergeReport> {
        let _flusher = FlushLater::new(self);
        match event {
            AuthEvent::SignedIn(session) => self.sign_in(session).await,
            AuthEvent::SignedOut => {
                self.sign_out();
                None
            }
            AuthEvent::TokenRefreshed { access_token } => {
                // Only the stored credential changes; no sync is triggered.
                if let Some(session) = self.inner.session.borrow_mut().as_mut() {
                    session.access_token = access_token;
                }
                None
            }
        }
    }

    /// Re-check the signed-in user's role. Stale responses are discarded:
    /// only the most recently issued request may apply its result.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn refresh_role(&self) -> bool {
        Inner::refresh_role(&self.inner).await
    }
}

impl Trolley {
    /// The sign-in merge. Runs at most once at a time; a duplicate sign-in
    /// event while one is in flight is a no-op.
    async fn sign_in(&self, session: Session) -> Option<MergeReport> {
        let inner = &self.inner;
        let Some(ticket) = inner.merge_gate.begin() else {
            log::info!("Sign-in merge already running, ignoring duplicate event");
            return None;
        };
        *inner.session.borrow_mut() = Some(session.clone());

        let config = supabase::supabase_config();
        let remote = match trolley::supabase::fetch_remote_cart(
            &config,
            &session.access_token,
            &session.user_id,
        )
        .await
        {
            Ok(remote) => remote.unwrap_or_default(),
            Err(e) => {
                log::warn!("Could not fetch the server cart, keeping the local one: {e:?}");
                inner.merge_gate.finish(ticket);
                return None;
            }
        };

        if !inner.merge_gate.is_current(&ticket) {
            // Signed out while the fetch was in flight; the result is stale.
            inner.merge_gate.finish(ticket);
            return None;
        }

        // Merge against the cart as it stands *now*, with no suspension
        // point between read, merge, and write-back, so a mutation made
        // while the fetch was in flight is never lost.
        let (report, rev_at_merge) = {
            let mut store = inner.store.borrow_mut();
            let (merged, report) = Cart::merge(store.cart().clone(), remote);
            store.replace_cart(merged);
            (report, store.rev())
        };
        Inner::persist_local(inner);

        // Push the merge outcome immediately so it is on the server before
        // anything else can race it.
        if let Err(e) = trolley::supabase::sync_cart_with_supabase(
            &inner.store,
            &config,
            &session.access_token,
            &session.user_id,
        )
        .await
        {
            log::warn!("Could not push the merged cart: {e:?}");
        }
        inner.merge_gate.finish(ticket);

        // Anything the shopper did while the merged cart was being pushed
        // still needs its own push.
        if inner.store.borrow().rev() != rev_at_merge {
            Inner::schedule_push(inner);
        }

        #[cfg(target_arch = "wasm32")]
        Inner::spawn_role_refresh(inner);

        Some(report)
    }

    /// Sign-out touches neither local storage nor the server row; the local
    /// cart stays authoritative until the next sign-in merge.
    fn sign_out(&self) {
        let inner = &self.inner;
        inner.merge_gate.invalidate();
        inner.debounce.reset();
        inner.timer.cancel();
        *inner.session.borrow_mut() = None;
        *inner.role.borrow_mut() = None;
        inner
            .role_generation
            .set(inner.role_generation.get() + 1);
    }

    /// Flush pending store notifications safely, avoiding RefCell re-borrows
    /// during callbacks.
    fn flush_notifications(&self) {
        // do it like this to avoid holding the borrow while we call the callbacks
        let notifications = self.inner.store.borrow_mut().drain_due_notifications();
        // that's important because many of these callbacks will call back into rust functions that themselves do borrow_mut()
        for notification in notifications {
            notification();
        }
    }
}

impl Inner {
    /// Runs after every cart mutation: synchronous local write, then a
    /// (re)started debounce timer toward the server.
    pub(crate) fn after_mutation(inner: &Rc<Inner>) {
        Inner::persist_local(inner);
        Inner::schedule_push(inner);
    }

    fn persist_local(inner: &Rc<Inner>) {
        #[cfg(target_arch = "wasm32")]
        {
            inner
                .store
                .borrow_mut()
                .mark_sync_started(SyncTarget::LocalStorage);
            let cart = inner.store.borrow().cart().clone();
            let error = trolley::local::save(&cart).err().map(|e| e.to_string());
            if let Some(e) = &error {
                // Non-fatal: the in-memory cart stays correct for the session.
                log::warn!("Cart save failed: {e}");
            }
            inner
                .store
                .borrow_mut()
                .mark_sync_finished(SyncTarget::LocalStorage, error);
        }
        #[cfg(not(target_arch = "wasm32"))]
        let _ = inner;
    }

    /// Cancel-and-restart the debounce timer, if a push is warranted at
    /// all. The epoch is noted unconditionally so a timer left over from an
    /// earlier state can never fire.
    fn schedule_push(inner: &Rc<Inner>) {
        let epoch = inner.debounce.note_mutation();
        if inner.session.borrow().is_none() {
            return;
        }
        if inner.merge_gate.in_flight() {
            // The sign-in merge pushes its own result; mutations that land
            // during it are caught by the rev comparison afterwards.
            return;
        }

        #[cfg(target_arch = "wasm32")]
        {
            let rc = Rc::clone(inner);
            inner.timer.restart(
                DEBOUNCE_WINDOW_MS,
                Box::new(move || Inner::push_now(&rc, epoch)),
            );
        }
        #[cfg(not(target_arch = "wasm32"))]
        let _ = epoch;
    }

    #[cfg(target_arch = "wasm32")]
    fn push_now(inner: &Rc<Inner>, epoch: u64) {
        if !inner.debounce.should_fire(epoch) {
            return;
        }
        if inner.merge_gate.in_flight() {
            return;
        }
        let Some(session) = inner.session.borrow().clone() else {
            return;
        };

        let rc = Rc::clone(inner);
        wasm_bindgen_futures::spawn_local(async move {
            let config = supabase::supabase_config();
            // Reads the cart at send time; errors are recorded on the store
            // and the next mutation's push naturally retries with newer
            // state.
            let _ = trolley::supabase::sync_cart_with_supabase(
                &rc.store,
                &config,
                &session.access_token,
                &session.user_id,
            )
            .await;
        });
    }

    #[cfg(target_arch = "wasm32")]
    fn spawn_role_refresh(inner: &Rc<Inner>) {
        let rc = Rc::clone(inner);
        wasm_bindgen_futures::spawn_local(async move {
            Inner::refresh_role(&rc).await;
        });
    }

    async fn refresh_role(inner: &Rc<Inner>) -> bool {
        let Some(session) = inner.session.borrow().clone() else {
            return false;
        };
        let generation = inner.role_generation.get() + 1;
        inner.role_generation.set(generation);

        let config = supabase::supabase_config();
        match auth::fetch_role(&config, &session.access_token, &session.user_id).await {
            Ok(role) => {
                // A newer request (or a sign-out) supersedes this result.
                if inner.role_generation.get() == generation {
                    *inner.role.borrow_mut() = role;
                }
            }
            Err(e) => log::warn!("Role lookup failed: {e:?}"),
        }

        matches!(inner.role.borrow().as_deref(), Some("admin"))
    }
}

/// Owns the one pending debounce timer. Restarting drops the previous
/// closure, which is safe because timer callbacks never run while another
/// callback is executing.
#[derive(Default)]
struct SyncTimer {
    #[cfg(target_arch = "wasm32")]
    pending: RefCell<Option<(i32, Closure<dyn FnMut()>)>>,
}

impl SyncTimer {
    #[cfg(target_arch = "wasm32")]
    fn restart(&self, delay_ms: i32, callback: Box<dyn FnMut()>) {
        self.cancel();
        let closure = Closure::wrap(callback);
        let Some(window) = web_sys::window() else {
            log::warn!("No window; cannot schedule a cart push");
            return;
        };
        match window.set_timeout_with_callback_and_timeout_and_arguments_0(
            closure.as_ref().unchecked_ref(),
            delay_ms,
        ) {
            Ok(handle) => *self.pending.borrow_mut() = Some((handle, closure)),
            Err(e) => log::warn!("Failed to schedule a cart push: {e:?}"),
        }
    }

    fn cancel(&self) {
        #[cfg(target_arch = "wasm32")]
        if let Some((handle, _closure)) = self.pending.borrow_mut().take() {
            if let Some(window) = web_sys::window() {
                window.clear_timeout_with_handle(handle);
            }
        }
    }
}

struct FlushLater<'a> {
    trolley: &'a Trolley,
}

impl<'a> FlushLater<'a> {
    pub(crate) fn new(trolley: &'a Trolley) -> Self {
        Self { trolley }
    }
}

impl<'a> Drop for FlushLater<'a> {
    fn drop(&mut self) {
        self.trolley.flush_notifications();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(product_id: &str, price_cents: i64, quantity: u32) -> ProductSnapshot {
        ProductSnapshot {
            product_id: product_id.to_string(),
            name: format!("Product {product_id}"),
            price_cents,
            image_url: None,
            quantity,
        }
    }

    #[test]
    fn fresh_cart_is_initialized_and_empty() {
        let trolley = Trolley::new();
        assert!(trolley.initialized());
        assert_eq!(trolley.item_count(), 0);
        assert_eq!(trolley.distinct_lines(), 0);
        assert_eq!(trolley.total_cents(), 0.0);
        assert!(trolley.user_id().is_none());
    }

    #[test]
    fn mutations_flow_through_to_the_reads() {
        let trolley = Trolley::new();
        trolley.add(snapshot("shirt", 2500, 2));
        trolley.add(snapshot("hat", 1200, 1));
        assert_eq!(trolley.item_count(), 3);
        assert_eq!(trolley.total_cents(), (2500 * 2 + 1200) as f64);

        trolley.set_quantity("shirt".to_string(), 1);
        assert_eq!(trolley.item_count(), 2);

        trolley.set_quantity("hat".to_string(), 0);
        assert_eq!(trolley.distinct_lines(), 1);

        trolley.clear();
        assert_eq!(trolley.distinct_lines(), 0);
        assert!(trolley.initialized());
    }

    #[test]
    fn current_cart_preserves_insertion_order() {
        let trolley = Trolley::new();
        trolley.add(snapshot("a", 100, 1));
        trolley.add(snapshot("b", 100, 1));
        trolley.add(snapshot("c", 100, 1));
        trolley.remove("b".to_string());
        let order: Vec<_> = trolley
            .current_cart()
            .into_iter()
            .map(|line| line.product_id)
            .collect();
        assert_eq!(order, ["a", "c"]);
    }
}
