// Secret provider trait
//
// Named credentials (LLM API key, SMS gateway, tool-visible secrets) resolve
// through this seam. A secret is a flat map of string fields; the SMS
// gateway secret carries account_sid / auth_token / from_number.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use leadforge_core::{Result, WorkerError};

pub type SecretMap = BTreeMap<String, String>;

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<SecretMap>;
}

/// Resolves secrets from environment variables.
///
/// The secret name is uppercased with non-alphanumerics mapped to `_` and
/// used as a prefix: secret "sms-gateway" field "auth_token" reads
/// `SMS_GATEWAY_AUTH_TOKEN`. A bare `SMS_GATEWAY` variable containing JSON
/// is also honored.
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    fn env_key(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretMap> {
        let prefix = Self::env_key(name);

        if let Ok(raw) = std::env::var(&prefix) {
            if let Ok(map) = serde_json::from_str::<SecretMap>(&raw) {
                return Ok(map);
            }
            let mut map = SecretMap::new();
            map.insert("value".to_string(), raw);
            return Ok(map);
        }

        let mut map = SecretMap::new();
        let wanted = format!("{prefix}_");
        for (key, value) in std::env::vars() {
            if let Some(field) = key.strip_prefix(&wanted) {
                map.insert(field.to_lowercase(), value);
            }
        }
        if map.is_empty() {
            return Err(WorkerError::Authentication(format!(
                "Secret {name} not found in environment"
            )));
        }
        Ok(map)
    }
}

/// Fixed secrets for tests
#[derive(Default)]
pub struct StaticSecretProvider {
    secrets: Mutex<BTreeMap<String, SecretMap>>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, secret: SecretMap) {
        self.secrets.lock().unwrap().insert(name.into(), secret);
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretMap> {
        self.secrets
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| WorkerError::Authentication(format!("Secret {name} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_key_normalization() {
        assert_eq!(EnvSecretProvider::env_key("sms-gateway"), "SMS_GATEWAY");
        assert_eq!(EnvSecretProvider::env_key("leadmagnet/twilio"), "LEADMAGNET_TWILIO");
    }

    #[tokio::test]
    async fn static_provider_round_trips() {
        let provider = StaticSecretProvider::new();
        let mut secret = SecretMap::new();
        secret.insert("auth_token".into(), "tok".into());
        provider.insert("sms-gateway", secret);

        let loaded = provider.get_secret("sms-gateway").await.unwrap();
        assert_eq!(loaded.get("auth_token").map(String::as_str), Some("tok"));
        assert!(provider.get_secret("missing").await.is_err());
    }
}
