// ── Shared access signature tokens ──
//
// `SharedAccessSignature sr={uri}&sig={sig}&se={expiry}[&skn={policy}]`
// where `sig = base64(HMAC-SHA256(base64_decode(key), "{uri}\n{expiry}"))`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use url::form_urlencoded;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default lifetime of generated tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Generate a SAS token valid for `ttl` from now.
pub fn generate_token(
    resource_uri: &str,
    key: &SecretString,
    policy_name: Option<&str>,
    ttl: Duration,
) -> Result<String, Error> {
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let expiry = Utc::now().timestamp().saturating_add(ttl_secs);
    generate_token_at(resource_uri, key, policy_name, expiry)
}

/// Generate a SAS token with an explicit expiry (seconds since the epoch).
pub fn generate_token_at(
    resource_uri: &str,
    key: &SecretString,
    policy_name: Option<&str>,
    expiry: i64,
) -> Result<String, Error> {
    let encoded_uri = encode(resource_uri);
    let key_bytes = STANDARD
        .decode(key.expose_secret())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;

    let mut mac =
        HmacSha256::new_from_slice(&key_bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
    mac.update(format!("{encoded_uri}\n{expiry}").as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        encode(&signature)
    );
    if let Some(policy) = policy_name {
        token.push_str("&skn=");
        token.push_str(&encode(policy));
    }
    Ok(token)
}

fn encode(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
