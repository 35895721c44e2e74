use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::persistence::Persistence;
use crate::types::ApiKey;
use crate::{GatewayError, Result};

/// SHA-256 of an API key, lowercase hex. Only digests are ever persisted.
pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Validates API keys from the `Authorization` header. Pure over the store:
/// `last_used_at` bookkeeping is the orchestrator's job.
pub struct Authenticator {
    store: Arc<dyn Persistence>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, auth_header: Option<&str>) -> Result<ApiKey> {
        self.authenticate_at(auth_header, SystemTime::now()).await
    }

    pub async fn authenticate_at(
        &self,
        auth_header: Option<&str>,
        now: SystemTime,
    ) -> Result<ApiKey> {
        let header = auth_header.ok_or(GatewayError::AuthMissing)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(GatewayError::AuthMalformed)?;

        let hash = hash_key(token);

        let key = match self.store.find_key_by_hash(&hash).await? {
            Some(key) => key,
            None => {
                let key = self
                    .store
                    .find_key_by_previous_hash(&hash)
                    .await?
                    .ok_or(GatewayError::AuthUnknownKey)?;
                if !within_grace_window(&key, now) {
                    return Err(GatewayError::AuthUnknownKey);
                }
                key
            }
        };

        if !key.is_active {
            return Err(GatewayError::AuthRevoked);
        }

        Ok(key)
    }
}

/// A previous-hash match only counts while `rotated_at + grace_period > now`.
fn within_grace_window(key: &ApiKey, now: SystemTime) -> bool {
    match (key.rotated_at, key.grace_period) {
        (Some(rotated_at), Some(grace)) => rotated_at + grace > now,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, SeedState};
    use std::time::Duration;

    fn key(hash: &str) -> ApiKey {
        ApiKey {
            id: "k1".to_string(),
            environment_id: "e1".to_string(),
            route_id: None,
            key_hash: hash.to_string(),
            previous_key_hash: None,
            rotated_at: None,
            grace_period: None,
            scopes: vec!["chat".to_string()],
            rate_limit_rpm: Some(60),
            is_active: true,
            last_used_at: None,
        }
    }

    fn store_with(keys: Vec<ApiKey>) -> Authenticator {
        Authenticator::new(Arc::new(MemoryStore::new(SeedState {
            api_keys: keys,
            ..SeedState::default()
        })))
    }

    #[test]
    fn hash_is_stable_lowercase_hex() {
        let a = hash_key("sk-test");
        let b = hash_key("sk-test");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(hash_key("sk-test"), hash_key("sk-test2"));
    }

    #[tokio::test]
    async fn accepts_current_key() -> Result<()> {
        let auth = store_with(vec![key(&hash_key("sk-ok"))]);
        let found = auth.authenticate(Some("Bearer sk-ok")).await?;
        assert_eq!(found.id, "k1");
        Ok(())
    }

    #[tokio::test]
    async fn missing_and_malformed_headers_fail_distinctly() {
        let auth = store_with(vec![key(&hash_key("sk-ok"))]);
        assert!(matches!(
            auth.authenticate(None).await.unwrap_err(),
            GatewayError::AuthMissing
        ));
        assert!(matches!(
            auth.authenticate(Some("Token sk-ok")).await.unwrap_err(),
            GatewayError::AuthMalformed
        ));
    }

    #[tokio::test]
    async fn revoked_key_fails_even_on_hash_match() {
        let mut revoked = key(&hash_key("sk-ok"));
        revoked.is_active = false;
        let auth = store_with(vec![revoked]);
        assert!(matches!(
            auth.authenticate(Some("Bearer sk-ok")).await.unwrap_err(),
            GatewayError::AuthRevoked
        ));
    }

    #[tokio::test]
    async fn previous_hash_honored_inside_grace_window() -> Result<()> {
        let now = SystemTime::now();
        let mut rotated = key(&hash_key("sk-new"));
        rotated.previous_key_hash = Some(hash_key("sk-old"));
        rotated.rotated_at = Some(now - Duration::from_secs(60));
        rotated.grace_period = Some(Duration::from_secs(300));
        let auth = store_with(vec![rotated]);

        let found = auth.authenticate_at(Some("Bearer sk-old"), now).await?;
        assert_eq!(found.id, "k1");
        Ok(())
    }

    #[tokio::test]
    async fn previous_hash_rejected_after_grace_window() {
        let now = SystemTime::now();
        let mut rotated = key(&hash_key("sk-new"));
        rotated.previous_key_hash = Some(hash_key("sk-old"));
        rotated.rotated_at = Some(now - Duration::from_secs(600));
        rotated.grace_period = Some(Duration::from_secs(300));
        let auth = store_with(vec![rotated]);

        assert!(matches!(
            auth.authenticate_at(Some("Bearer sk-old"), now)
                .await
                .unwrap_err(),
            GatewayError::AuthUnknownKey
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let auth = store_with(vec![key(&hash_key("sk-ok"))]);
        assert!(matches!(
            auth.authenticate(Some("Bearer sk-nope")).await.unwrap_err(),
            GatewayError::AuthUnknownKey
        ));
    }
}
