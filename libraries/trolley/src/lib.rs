//! This is a library for keeping a shopping cart alive across reloads, logins, and devices.
//! It was created for tienda, so it doesn't include much that was not needed for that project.
//!
//! Syncing strategy:
//! 1. The cart lives in memory as an insertion-ordered list of lines, at most one line per product.
//! 2. Every mutation is written synchronously to device-local storage, so a reload never loses more than nothing.
//! 3. While a user is signed in, mutations are additionally pushed to a single per-user row on the server, debounced so rapid edits coalesce into one write. Each push replaces the whole row.
//! 4. At the moment of sign-in, the local cart and the server cart are merged once: lines only the server knows are adopted, and for lines both sides know the larger quantity wins. The merged result is written back to both sides before anything else can touch it.
//!
//! Sounds simple, but the interleavings are where the bugs live, and this library handles them.

#[cfg(feature = "supabase")]
pub mod supabase;

#[cfg(feature = "localstorage")]
pub mod local;

pub mod gate;
pub mod store;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use indexmap::map::Entry;

/// What the UI hands us when the shopper puts a product in the cart.
/// Everything except the quantity is a point-in-time snapshot of the catalog
/// entry; it is never re-fetched once captured.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "tsify", derive(tsify::Tsify))]
#[cfg_attr(feature = "tsify", tsify(into_wasm_abi, from_wasm_abi))]
pub struct ProductSnapshot {
    pub product_id: String,
    pub name: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub quantity: u32,
}

/// One product held in the cart.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "tsify", derive(tsify::Tsify))]
#[cfg_attr(feature = "tsify", tsify(into_wasm_abi, from_wasm_abi))]
pub struct CartLine {
    pub product_id: String,
    pub name: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub quantity: u32,
    pub added_at: DateTime<Utc>,
}

/// The cart itself. Keyed by product id, so the one-line-per-product
/// invariant is structural rather than something we have to remember to
/// check. Insertion order is preserved for display only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cart {
    lines: IndexMap<String, CartLine>,
}

/// What happened during a sign-in merge. `true_merge` is only set when both
/// sides actually had lines; the UI uses it to decide whether a "carts
/// combined" notice is worth showing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "tsify", derive(tsify::Tsify))]
#[cfg_attr(feature = "tsify", tsify(into_wasm_abi, from_wasm_abi))]
pub struct MergeReport {
    /// Lines adopted from the server that this device had never seen.
    pub lines_from_remote: usize,
    /// Products both sides held; the larger quantity won.
    pub quantity_conflicts: usize,
    pub true_merge: bool,
}

/// Every persisted cart (device-local value and server row payload alike) is
/// wrapped in this enum so old payloads stay decodable after the shape
/// changes.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "version")]
pub enum VersionedCartSnapshot {
    V1 { lines: Vec<CartLine> },
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of distinct products in the cart.
    pub fn distinct_lines(&self) -> usize {
        self.lines.len()
    }

    /// Total units across all lines; what the cart badge shows.
    pub fn item_count(&self) -> u32 {
        self.lines.values().map(|line| line.quantity).sum()
    }

    pub fn total_cents(&self) -> i64 {
        self.lines
            .values()
            .map(|line| line.price_cents * i64::from(line.quantity))
            .sum()
    }

    pub fn get(&self, product_id: &str) -> Option<&CartLine> {
        self.lines.get(product_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CartLine> {
        self.lines.values()
    }

    /// Put a product in the cart. If the product is already there, only the
    /// quantity is bumped; the original snapshot fields and position are
    /// kept, since the cart records what the shopper saw when they added it.
    pub fn add(&mut self, snapshot: ProductSnapshot) {
        let quantity = snapshot.quantity.max(1);
        match self.lines.entry(snapshot.product_id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().quantity += quantity;
            }
            Entry::Vacant(entry) => {
                entry.insert(CartLine {
                    product_id: snapshot.product_id,
                    name: snapshot.name,
                    price_cents: snapshot.price_cents,
                    image_url: snapshot.image_url,
                    quantity,
                    added_at: Utc::now(),
                });
            }
        }
    }

    /// Returns true if a line was actually removed.
    pub fn remove(&mut self, product_id: &str) -> bool {
        self.lines.shift_remove(product_id).is_some()
    }

    /// Set the quantity of an existing line. Zero or negative deletes the
    /// line outright; a line with quantity 0 must never exist. Setting a
    /// quantity on a product that isn't in the cart does nothing.
    /// Returns true if the cart changed.
    pub fn set_quantity(&mut self, product_id: &str, quantity: i32) -> bool {
        if quantity <= 0 {
            return self.remove(product_id);
        }
        match self.lines.get_mut(product_id) {
            Some(line) if line.quantity != quantity as u32 => {
                line.quantity = quantity as u32;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) -> bool {
        if self.lines.is_empty() {
            return false;
        }
        self.lines.clear();
        true
    }

    /// The sign-in merge. Local lines come first in their own order, lines
    /// only the server knows are appended in server order, and when both
    /// sides hold the same product the larger quantity wins (the local
    /// snapshot fields are kept). Neither side is more correct than the
    /// other, so this is a heuristic for "what the shopper meant", not a
    /// guarantee.
    pub fn merge(local: Cart, remote: Cart) -> (Cart, MergeReport) {
        let true_merge = !local.is_empty() && !remote.is_empty();
        let mut merged = local;
        let mut lines_from_remote = 0;
        let mut quantity_conflicts = 0;

        for (product_id, remote_line) in remote.lines {
            match merged.lines.entry(product_id) {
                Entry::Occupied(mut entry) => {
                    quantity_conflicts += 1;
                    if remote_line.quantity > entry.get().quantity {
                        entry.get_mut().quantity = remote_line.quantity;
                    }
                }
                Entry::Vacant(entry) => {
                    lines_from_remote += 1;
                    entry.insert(remote_line);
                }
            }
        }

        (
            merged,
            MergeReport {
                lines_from_remote,
                quantity_conflicts,
                true_merge,
            },
        )
    }

    pub fn to_snapshot(&self) -> VersionedCartSnapshot {
        VersionedCartSnapshot::V1 {
            lines: self.lines.values().cloned().collect(),
        }
    }

    /// Rebuild a cart from a persisted snapshot. Stored data is not trusted
    /// to uphold our invariants: duplicate product ids are coalesced (larger
    /// quantity wins, first position wins) and zero-quantity lines are
    /// dropped.
    pub fn from_snapshot(snapshot: VersionedCartSnapshot) -> Cart {
        let VersionedCartSnapshot::V1 { lines } = snapshot;
        let mut cart = Cart::default();
        for line in lines {
            if line.quantity == 0 {
                log::warn!(
                    "Dropping stored cart line for {} with quantity 0",
                    line.product_id
                );
                continue;
            }
            match cart.lines.entry(line.product_id.clone()) {
                Entry::Occupied(mut entry) => {
                    log::warn!("Duplicate stored cart line for {}", line.product_id);
                    if line.quantity > entry.get().quantity {
                        entry.get_mut().quantity = line.quantity;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(line);
                }
            }
        }
        cart
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_snapshot())
    }

    pub fn from_json(raw: &str) -> Result<Cart, serde_json::Error> {
        serde_json::from_str::<VersionedCartSnapshot>(raw).map(Cart::from_snapshot)
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

    fn cart_of(entries: &[(&str, u32)]) -> Cart {
        let mut cart = Cart::default();
        for (product_id, quantity) in entries {
            cart.add(snapshot(product_id, 1000, *quantity));
        }
        cart
    }

    #[test]
    fn add_then_remove() {
        let mut cart = Cart::default();
        cart.add(snapshot("shirt", 2500, 1));
        assert_eq!(cart.distinct_lines(), 1);
        assert!(cart.remove("shirt"));
        assert!(cart.is_empty());
        assert!(!cart.remove("shirt"));
    }

    #[test]
    fn adding_same_product_bumps_quantity_and_keeps_snapshot() {
        let mut cart = Cart::default();
        cart.add(snapshot("shirt", 2500, 1));
        // Catalog price changed between adds; the line must keep the price
        // the shopper saw the first time.
        cart.add(snapshot("shirt", 9999, 2));
        let line = cart.get("shirt").unwrap();
        assert_eq!(line.quantity, 3);
        assert_eq!(line.price_cents, 2500);
        assert_eq!(cart.distinct_lines(), 1);
    }

    #[test]
    fn set_quantity_zero_or_negative_removes_the_line() {
        let mut cart = cart_of(&[("shirt", 2)]);
        assert!(cart.set_quantity("shirt", 0));
        assert!(cart.get("shirt").is_none());

        let mut cart = cart_of(&[("shirt", 2)]);
        assert!(cart.set_quantity("shirt", -1));
        assert!(cart.get("shirt").is_none());
    }

    #[test]
    fn set_quantity_on_missing_product_is_a_noop() {
        let mut cart = cart_of(&[("shirt", 2)]);
        assert!(!cart.set_quantity("hat", 5));
        assert_eq!(cart.distinct_lines(), 1);
    }

    #[test]
    fn empty_cart_totals_are_zero() {
        let cart = Cart::default();
        assert_eq!(cart.item_count(), 0);
        assert_eq!(cart.distinct_lines(), 0);
        assert_eq!(cart.total_cents(), 0);
    }

    #[test]
    fn total_cents_is_price_times_quantity() {
        let mut cart = Cart::default();
        cart.add(snapshot("shirt", 2500, 2));
        cart.add(snapshot("hat", 1200, 1));
        assert_eq!(cart.total_cents(), 2500 * 2 + 1200);
        assert_eq!(cart.item_count(), 3);
    }

    #[test]
    fn merge_of_disjoint_carts_is_the_union() {
        let local = cart_of(&[("a", 1), ("b", 2)]);
        let remote = cart_of(&[("c", 3), ("d", 4)]);
        let (merged, report) = Cart::merge(local, remote);

        let order: Vec<_> = merged.iter().map(|l| l.product_id.as_str()).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
        assert_eq!(merged.get("a").unwrap().quantity, 1);
        assert_eq!(merged.get("d").unwrap().quantity, 4);
        assert_eq!(report.lines_from_remote, 2);
        assert_eq!(report.quantity_conflicts, 0);
        assert!(report.true_merge);
    }

    #[test]
    fn merge_keeps_the_larger_quantity() {
        let (merged, _) = Cart::merge(cart_of(&[("p", 2)]), cart_of(&[("p", 5)]));
        assert_eq!(merged.get("p").unwrap().quantity, 5);

        let (merged, _) = Cart::merge(cart_of(&[("p", 7)]), cart_of(&[("p", 3)]));
        assert_eq!(merged.get("p").unwrap().quantity, 7);
    }

    #[test]
    fn merge_after_sign_in_scenario() {
        // Anonymous shopper has {A:1, B:2}; their account's server cart has
        // {B:1, C:3}. The merged cart must be {A:1, B:2, C:3}.
        let local = cart_of(&[("a", 1), ("b", 2)]);
        let remote = cart_of(&[("b", 1), ("c", 3)]);
        let (merged, report) = Cart::merge(local, remote);

        assert_eq!(merged.distinct_lines(), 3);
        assert_eq!(merged.get("a").unwrap().quantity, 1);
        assert_eq!(merged.get("b").unwrap().quantity, 2);
        assert_eq!(merged.get("c").unwrap().quantity, 3);
        assert_eq!(report.lines_from_remote, 1);
        assert_eq!(report.quantity_conflicts, 1);
        assert!(report.true_merge);
    }

    #[test]
    fn merging_identical_carts_changes_nothing() {
        let cart = cart_of(&[("a", 1), ("b", 2)]);
        let (merged, report) = Cart::merge(cart.clone(), cart.clone());
        assert_eq!(merged, cart);
        assert_eq!(report.lines_from_remote, 0);
        assert_eq!(report.quantity_conflicts, 2);
    }

    #[test]
    fn merge_with_an_empty_side_is_not_a_true_merge() {
        let (merged, report) = Cart::merge(cart_of(&[("a", 1)]), Cart::default());
        assert_eq!(merged.distinct_lines(), 1);
        assert!(!report.true_merge);

        let (merged, report) = Cart::merge(Cart::default(), cart_of(&[("a", 1)]));
        assert_eq!(merged.distinct_lines(), 1);
        assert!(!report.true_merge);

        let (merged, report) = Cart::merge(Cart::default(), Cart::default());
        assert!(merged.is_empty());
        assert!(!report.true_merge);
    }

    #[test]
    fn json_round_trip_reproduces_the_cart() {
        let mut cart = Cart::default();
        cart.add(ProductSnapshot {
            product_id: "shirt".to_string(),
            name: "Linen shirt".to_string(),
            price_cents: 2500,
            image_url: Some("https://cdn.example/shirt.jpg".to_string()),
            quantity: 2,
        });
        cart.add(snapshot("hat", 1200, 1));

        let raw = cart.to_json().unwrap();
        let restored = Cart::from_json(&raw).unwrap();
        assert_eq!(restored, cart);
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(Cart::from_json("not json at all").is_err());
        assert!(Cart::from_json("{\"version\":\"V9\",\"lines\":[]}").is_err());
    }

    #[test]
    fn from_snapshot_coalesces_duplicates_and_drops_zero_quantities() {
        let mut line_a = CartLine {
            product_id: "a".to_string(),
            name: "A".to_string(),
            price_cents: 100,
            image_url: None,
            quantity: 2,
            added_at: Utc::now(),
        };
        let mut duplicate = line_a.clone();
        duplicate.quantity = 5;
        let mut zero = line_a.clone();
        zero.product_id = "z".to_string();
        zero.quantity = 0;
        line_a.quantity = 2;

        let cart = Cart::from_snapshot(VersionedCartSnapshot::V1 {
            lines: vec![line_a, duplicate, zero],
        });
        assert_eq!(cart.distinct_lines(), 1);
        assert_eq!(cart.get("a").unwrap().quantity, 5);
    }
}
