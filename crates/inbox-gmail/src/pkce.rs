//! PKCE (RFC 7636, S256) and OAuth state generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct PkcePair {
    /// 32 random bytes, base64url without padding (43 chars).
    pub verifier: String,
    /// SHA-256 of the verifier, base64url without padding.
    pub challenge: String,
}

pub fn generate_pkce() -> PkcePair {
    let verifier = random_token();
    PkcePair {
        challenge: challenge_for(&verifier),
        verifier,
    }
}

pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Opaque random value for the OAuth `state` parameter.
pub fn generate_state() -> String {
    random_token()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Percent-encode a query parameter value.
pub fn urlencoded(s: &str) -> String {
    s.replace('%', "%25")
        .replace(' ', "%20")
        .replace('&', "%26")
        .replace('=', "%3D")
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace(':', "%3A")
        .replace('?', "%3F")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_lengths_and_relation() {
        let pair = generate_pkce();
        assert_eq!(pair.verifier.len(), 43);
        assert_eq!(pair.challenge.len(), 43);
        assert_eq!(pair.challenge, challenge_for(&pair.verifier));
    }

    #[test]
    fn rfc7636_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn states_are_unique() {
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn urlencoded_reserved() {
        assert_eq!(urlencoded("http://localhost:8000/cb?x=1"), "http%3A%2F%2Flocalhost%3A8000%2Fcb%3Fx%3D1");
        assert_eq!(urlencoded("a b"), "a%20b");
    }
}
