//! Order placement. The heavy lifting (payment session, webhook, stock)
//! belongs to the payment gateway and the backend; from here checkout is
//! two REST calls and then emptying the cart.

use wasm_bindgen::prelude::*;

use trolley::Cart;

use crate::supabase::supabase_config;
use crate::{FlushLater, Inner, Trolley};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct ShippingDetails {
    pub email: String,
    pub full_name: String,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub phone: Option<String>,
}

/// Where to send the shopper to pay.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct CheckoutRedirect {
    pub url: String,
}

#[derive(serde::Deserialize)]
struct PreferenceResponse {
    init_point: String,
}

/// The order row as inserted. Line items carry the snapshot the shopper saw
/// in the cart, so the order records what was actually sold at what price.
pub(crate) fn order_payload(
    cart: &Cart,
    details: &ShippingDetails,
    user_id: &str,
) -> serde_json::Value {
    use serde_json::json;

    json!({
        "user_id": user_id,
        "email": details.email,
        "shipping": {
            "full_name": details.full_name,
            "address_line1": details.address_line1,
            "address_line2": details.address_line2,
            "city": details.city,
            "postal_code": details.postal_code,
            "phone": details.phone,
        },
        "items": cart
            .iter()
            .map(|line| {
                json!({
                    "product_id": line.product_id,
                    "name": line.name,
                    "price_cents": line.price_cents,
                    "quantity": line.quantity,
                })
            })
            .collect::<Vec<_>>(),
        "item_count": cart.item_count(),
        "total_cents": cart.total_cents(),
        "status": "pending",
        "created_at": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Trolley {
    /// Insert the order, ask the gateway for a payment session, and empty
    /// the cart. The cart is only cleared once both calls succeeded, and it
    /// goes through the normal mutation path, so the emptied state reaches
    /// local storage synchronously and the server on the usual debounce.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn place_order(
        &self,
        details: ShippingDetails,
    ) -> Result<CheckoutRedirect, JsValue> {
        use fetch_happen::Client;

        let Some(session) = self.inner.session.borrow().clone() else {
            return Err(JsValue::from_str("Cannot check out without signing in"));
        };
        let cart = self.inner.store.borrow().cart().clone();
        if cart.is_empty() {
            return Err(JsValue::from_str("Cannot check out an empty cart"));
        }

        let config = supabase_config();
        let order = order_payload(&cart, &details, &session.user_id);

        let client = Client;
        let orders_url = format!("{}/rest/v1/orders", config.supabase_url);
        let response = client
            .post(&orders_url)
            .header("apikey", &config.supabase_anon_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .json(&order)
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
                "Order insert failed: {status} - {error_body}"
            )));
        }

        let preference_url = format!(
            "{}/functions/v1/create-payment-preference",
            config.supabase_url
        );
        let response = client
            .post(&preference_url)
            .header("apikey", &config.supabase_anon_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .json(&order)
            .map_err(|e| JsValue::from_str(&format!("{e:?}")))?
            .send()
            .await
            .map_err(|e| JsValue::from_str(&format!("{e:?}")))?;

        if !response.ok() {
            return Err(JsValue::from_str(&format!(
                "Payment preference failed with status: {}",
                response.status()
            )));
        }

        let preference: PreferenceResponse = response
            .json()
            .await
            .map_err(|e| JsValue::from_str(&format!("Response parsing error: {e:?}")))?;

        {
            let _flusher = FlushLater::new(self);
            self.inner.store.borrow_mut().clear();
            Inner::after_mutation(&self.inner);
        }

        Ok(CheckoutRedirect {
            url: preference.init_point,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trolley::ProductSnapshot;

    fn details() -> ShippingDetails {
        ShippingDetails {
            email: "shopper@example.com".to_string(),
            full_name: "Ana Paz".to_string(),
            address_line1: "Calle Falsa 123".to_string(),
            address_line2: None,
            city: "Rosario".to_string(),
            postal_code: "2000".to_string(),
            phone: None,
        }
    }

    #[test]
    fn order_payload_carries_lines_and_totals() {
        let mut cart = Cart::default();
        cart.add(ProductSnapshot {
            product_id: "shirt".to_string(),
            name: "Linen shirt".to_string(),
            price_cents: 2500,
            image_url: None,
            quantity: 2,
        });
        cart.add(ProductSnapshot {
            product_id: "hat".to_string(),
            name: "Straw hat".to_string(),
            price_cents: 1200,
            image_url: None,
            quantity: 1,
        });

        let payload = order_payload(&cart, &details(), "user-1");
        assert_eq!(payload["user_id"], "user-1");
        assert_eq!(payload["items"].as_array().unwrap().len(), 2);
        assert_eq!(payload["items"][0]["product_id"], "shirt");
        assert_eq!(payload["items"][0]["quantity"], 2);
        assert_eq!(payload["total_cents"], 2500 * 2 + 1200);
        assert_eq!(payload["item_count"], 3);
        assert_eq!(payload["status"], "pending");
    }
}
