use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// HMAC-SHA256 over the raw body, encoded the way the provider sends it.
pub fn sign(payload: &[u8], secret: &str, encoding: SignatureEncoding) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    let bytes = mac.finalize().into_bytes();
    match encoding {
        SignatureEncoding::Hex => hex::encode(bytes),
        SignatureEncoding::Base64 => STANDARD.encode(bytes),
    }
}

/// Constant-time verification. The comparison is done by `Mac::verify_slice`
/// on the decoded digest, so a mismatch in any byte costs the same.
pub fn verify_hmac_sha256(
    payload: &[u8],
    signature: &str,
    secret: &str,
    encoding: SignatureEncoding,
) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    if signature.is_empty() || secret.is_empty() {
        return false;
    }

    let expected = match encoding {
        SignatureEncoding::Hex => hex::decode(signature.to_ascii_lowercase()).ok(),
        SignatureEncoding::Base64 => STANDARD.decode(signature).ok(),
    };
    let Some(expected) = expected else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
