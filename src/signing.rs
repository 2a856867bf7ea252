use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA-256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

fn mac_for(secret: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        // HMAC takes keys of any length.
        Err(_) => unreachable!("hmac rejected key"),
    }
}

/// Compute the signature sent with a webhook.
///
/// Pure function of `secret` and `payload`: no timestamp or nonce is mixed in,
/// so identical inputs always give identical output.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Find the signature header (case-insensitive) in a list of headers.
pub fn parse_signature_header<'a, I>(headers: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationError::MissingSignature => write!(f, "signature header missing"),
            VerificationError::InvalidSignature => write!(f, "signature does not match payload"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// Verify an incoming webhook request in one call, for receivers.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = parse_signature_header(headers).ok_or(VerificationError::MissingSignature)?;
    if verify_signature(secret, payload, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
