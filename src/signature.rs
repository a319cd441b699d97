use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Literal signature accepted when the service runs in unsafe mode.
pub const UNSAFE_SIGNATURE: &str = "unsafe";

/// Incoming signatures may carry or omit the trailing `=` padding.
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature")] Missing,
    #[error("signature mismatch")] Mismatch,
    #[error("unusable signing key")] InvalidKey,
}

/// Verifies request paths against a process-wide HMAC-SHA1 secret.
///
/// The signed message is the percent-decoded request path with the leading
/// `/<signature>/` removed, e.g. `100x100/http://example.com/cat.png`. The
/// signature is the URL-safe base64 encoding of the digest.
#[derive(Clone)]
pub struct Verifier {
    key: Vec<u8>,
    allow_unsafe: bool,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("allow_unsafe", &self.allow_unsafe)
            .finish_non_exhaustive()
    }
}

impl Verifier {
    pub fn new(secret: impl Into<Vec<u8>>, allow_unsafe: bool) -> Self {
        Self { key: secret.into(), allow_unsafe }
    }

    pub fn verify(&self, sig: &str, message: &str) -> Result<(), SignatureError> {
        if sig.is_empty() { return Err(SignatureError::Missing); }
        if self.allow_unsafe && sig == UNSAFE_SIGNATURE { return Ok(()); }

        let supplied = LENIENT_URL_SAFE
            .decode(sig)
            .map_err(|_| SignatureError::Mismatch)?;
        let mut mac = Hmac::<Sha1>::new_from_slice(&self.key).map_err(|_| SignatureError::Mismatch)?;
        mac.update(message.as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&supplied).map_err(|_| SignatureError::Mismatch)
    }

    /// Produces the signature a client should put in front of `message`.
    pub fn sign(&self, message: &str) -> Result<String, SignatureError> {
        sign(&self.key, message)
    }
}

pub fn sign(secret: &[u8], message: &str) -> Result<String, SignatureError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Builds the full request path (`/<signature>/<message>`) for a message.
pub fn signed_path(secret: &[u8], message: &str) -> Result<String, SignatureError> {
    let message = message.trim_start_matches('/');
    Ok(format!("/{}/{}", sign(secret, message)?, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_literal_needs_opt_in() {
        let strict = Verifier::new("secret", false);
        assert_eq!(strict.verify("unsafe", "1x1/http://a/b.png"), Err(SignatureError::Mismatch));

        let lax = Verifier::new("secret", true);
        assert!(lax.verify("unsafe", "1x1/http://a/b.png").is_ok());
    }

    #[test]
    fn padding_is_optional() {
        let v = Verifier::new("secret", false);
        let msg = "300x0/https://example.com/a.jpg";
        let sig = v.sign(msg).unwrap();
        assert!(sig.ends_with('='));
        assert!(v.verify(sig.trim_end_matches('='), msg).is_ok());
    }

    #[test]
    fn signed_path_strips_leading_slash() {
        let path = signed_path(b"secret", "/10x10/http://a/b.png").unwrap();
        let (sig, rest) = path[1..].split_once('/').unwrap();
        assert_eq!(rest, "10x10/http://a/b.png");
        assert!(Verifier::new("secret", false).verify(sig, rest).is_ok());
    }

    #[test]
    fn empty_signature_is_missing() {
        let v = Verifier::new("secret", false);
        assert_eq!(v.verify("", "x"), Err(SignatureError::Missing));
    }

    #[test]
    fn any_key_length_signs() {
        assert!(sign(b"", "1x1/http://a/b.png").is_ok());
        assert!(sign(&[7u8; 200], "1x1/http://a/b.png").is_ok());
    }
}
