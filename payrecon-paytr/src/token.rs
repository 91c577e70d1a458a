//! Request signing for the PayTR report API.

use base64::Engine;
use hmac::{Hmac, Mac};
use payrecon_types::GatewayError;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `base64(HMAC-SHA256(merchant_key, merchant_id + start + end + merchant_salt))`
///
/// `start` and `end` must be the exact strings sent as `start_date` and
/// `end_date`.
pub fn report_token(
    merchant_id: &str,
    merchant_key: &str,
    merchant_salt: &str,
    start: &str,
    end: &str,
) -> Result<String, GatewayError> {
    let mut mac =
        HmacSha256::new_from_slice(merchant_key.as_bytes()).map_err(|error| GatewayError::Auth {
            detail: format!("unusable merchant key: {error}"),
        })?;
    mac.update(merchant_id.as_bytes());
    mac.update(start.as_bytes());
    mac.update(end.as_bytes());
    mac.update(merchant_salt.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_matches_reference_signature() {
        let token = report_token(
            "123456",
            "key-abc",
            "salt-xyz",
            "2026-01-05 00:00:00",
            "2026-01-05 23:59:59",
        )
        .unwrap();

        assert_eq!(token, "IBX7kR7+KP9n589J/8Fnk1FJ7iXVoHBnH4rkATx+Byg=");
    }

    #[test]
    fn token_depends_on_the_salt() {
        let first = report_token("1", "k", "salt-a", "s", "e").unwrap();
        let second = report_token("1", "k", "salt-b", "s", "e").unwrap();

        assert_ne!(first, second);
    }
}
