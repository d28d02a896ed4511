use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq)]
pub struct TokenClaims {
    pub session_id: String,
    pub user_id: String,
    pub expires_at: i64,
}

/// Issues and checks access tokens of the form
/// `<session id>.<user id>.<expiry>.<hex hmac>`.
#[derive(Clone)]
pub struct SessionSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl SessionSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        // The HMAC key is the SHA-256 of the secret, never the raw secret.
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        Self {
            key: hasher.finalize().to_vec(),
            ttl,
        }
    }

    pub fn issue(&self, user_id: &str, now: i64) -> (String, TokenClaims) {
        let claims = TokenClaims {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            expires_at: now + self.ttl.as_secs() as i64,
        };
        let payload = format!("{}.{}.{}", claims.session_id, claims.user_id, claims.expires_at);
        let signature = hex::encode(self.mac(&payload).finalize().into_bytes());
        (format!("{payload}.{signature}"), claims)
    }

    pub fn verify(&self, token: &str, now: i64) -> Option<TokenClaims> {
        let (payload, signature) = token.rsplit_once('.')?;
        let signature = hex::decode(signature).ok()?;
        self.mac(payload).verify_slice(&signature).ok()?;

        let mut parts = payload.splitn(3, '.');
        let claims = TokenClaims {
            session_id: parts.next()?.to_string(),
            user_id: parts.next()?.to_string(),
            expires_at: parts.next()?.parse().ok()?,
        };
        if claims.expires_at <= now {
            return None;
        }
        Some(claims)
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC takes keys of any size");
        mac.update(payload.as_bytes());
        mac
    }
}

/// Returns `(salt, hash)` for a fresh password, both hex encoded.
pub fn hash_password(password: &str) -> (String, String) {
    let salt = Uuid::new_v4().simple().to_string();
    let hash = hex::encode(password_mac(&salt, password).finalize().into_bytes());
    (salt, hash)
}

pub fn verify_password(password: &str, salt: &str, hash: &str) -> bool {
    match hex::decode(hash) {
        Ok(expected) => password_mac(salt, password).verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

fn password_mac(salt: &str, password: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes()).expect("HMAC takes keys of any size");
    mac.update(password.as_bytes());
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SessionSigner {
        SessionSigner::new("test-secret", Duration::from_secs(60))
    }

    #[test]
    fn issued_token_verifies() {
        let (token, claims) = signer().issue("user-1", 1_000);
        assert_eq!(signer().verify(&token, 1_000), Some(claims));
    }

    #[test]
    fn expired_token_is_rejected() {
        let (token, _) = signer().issue("user-1", 1_000);
        assert_eq!(signer().verify(&token, 1_060), None);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let (token, _) = signer().issue("user-1", 1_000);
        let forged = token.replacen("user-1", "user-2", 1);
        assert_eq!(signer().verify(&forged, 1_000), None);
        assert_eq!(signer().verify("not-a-token", 1_000), None);
    }

    #[test]
    fn other_secret_is_rejected() {
        let (token, _) = signer().issue("user-1", 1_000);
        let other = SessionSigner::new("other", Duration::from_secs(60));
        assert_eq!(other.verify(&token, 1_000), None);
    }

    #[test]
    fn password_round_trip() {
        let (salt, hash) = hash_password("hunter22");
        assert!(verify_password("hunter22", &salt, &hash));
        assert!(!verify_password("hunter23", &salt, &hash));
        assert!(!verify_password("hunter22", &salt, "zz"));
    }
}
