//! The boundary with the auth provider. Sign-in, sign-up, and token
//! management all live in the JS host's auth client; this module only
//! defines the events the host forwards to us and the one profile lookup we
//! make ourselves.

use trolley::supabase::SupabaseConfig;
use wasm_bindgen::JsValue;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

/// Discrete auth transitions, as forwarded by the JS host from its auth
/// subscription (plus the startup "current session" query, which arrives as
/// a `SignedIn` before the subscription's first event).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut,
    TokenRefreshed { access_token: String },
}

#[derive(serde::Deserialize)]
struct RoleRow {
    role: Option<String>,
}

/// Look up the signed-in user's role from their profile row. A missing row
/// or a null role both mean "plain shopper".
pub(crate) async fn fetch_role(
    config: &SupabaseConfig,
    access_token: &str,
    user_id: &str,
) -> Result<Option<String>, JsValue> {
    use fetch_happen::Client;

    let SupabaseConfig {
        supabase_url,
        supabase_anon_key,
    } = config;

    let url = format!("{supabase_url}/rest/v1/profiles?id=eq.{user_id}&select=role");

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
            "Role lookup failed with status: {}",
            response.status()
        )));
    }

    let rows: Vec<RoleRow> = response
        .json()
        .await
        .map_err(|e| JsValue::from_str(&format!("Response parsing error: {e:?}")))?;

    Ok(rows.into_iter().next().and_then(|row| row.role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_events_use_the_wire_shape_the_host_sends() {
        let event: AuthEvent = serde_json::from_str(
            "{\"type\":\"signed_in\",\"user_id\":\"u1\",\"access_token\":\"tok\"}",
        )
        .unwrap();
        assert_eq!(
            event,
            AuthEvent::SignedIn(Session {
                user_id: "u1".to_string(),
                access_token: "tok".to_string(),
            })
        );

        let event: AuthEvent = serde_json::from_str("{\"type\":\"signed_out\"}").unwrap();
        assert_eq!(event, AuthEvent::SignedOut);

        let event: AuthEvent =
            serde_json::from_str("{\"type\":\"token_refreshed\",\"access_token\":\"tok2\"}")
                .unwrap();
        assert_eq!(
            event,
            AuthEvent::TokenRefreshed {
                access_token: "tok2".to_string(),
            }
        );
    }
}
