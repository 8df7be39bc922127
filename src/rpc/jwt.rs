//! Engine-API JWT minting.
//!
//! Every request carries a fresh HS256 token over the fixed header
//! `{"alg":"HS256","typ":"JWT"}` and payload `{"iat": <unix seconds>}`,
//! signed with the hex-decoded shared secret. Tokens are never cached.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mints a token for the current time.
pub(crate) fn mint(secret: &[u8]) -> String {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    mint_at(secret, iat)
}

/// Mints a token with an explicit `iat` claim.
fn mint_at(secret: &[u8], iat: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"iat":{iat}}}"#));
    let signing_input = format!("{header}.{payload}");

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{signing_input}.{signature}")
}
