//! OS keyring-backed secret storage implementation.

use async_trait::async_trait;
use keyring::Entry;

use super::{Secret, SecretStore, StoreError};

/// Keyring user under which every tokenrelay entry is filed.
const KEYRING_USER: &str = "tokenrelay";

/// OS keyring-backed secret store.
///
/// This store uses the platform's native keyring service:
/// - macOS: Keychain
/// - Linux: Secret Service API (via libsecret)
/// - Windows: Credential Manager
///
/// Each key maps to one keyring entry whose service name is
/// `{service_name}/{key}`.
pub struct KeyringStore {
    service_name: String,
}

impl KeyringStore {
    /// Try to create a new keyring store.
    ///
    /// Returns an error if the keyring backend is not available on this platform.
    pub fn try_new(service_name: &str) -> Result<Self, StoreError> {
        let probe = format!("{}/__probe__", service_name);
        match Entry::new(&probe, KEYRING_USER) {
            Ok(_) => Ok(Self {
                service_name: service_name.to_string(),
            }),
            Err(e) => Err(StoreError::KeyringUnavailable {
                message: format!("keyring backend not available: {}", e),
            }),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        let service = format!("{}/{}", self.service_name, key);
        Entry::new(&service, KEYRING_USER).map_err(|e| StoreError::BackendError {
            message: format!("failed to open keyring entry: {}", e),
        })
    }
}

impl std::fmt::Debug for KeyringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringStore")
            .field("service_name", &self.service_name)
            .finish()
    }
}

#[async_trait]
impl SecretStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(password) => Ok(Some(Secret::new(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(keyring::Error::PlatformFailure(e)) => Err(StoreError::BackendError {
                message: format!("platform keyring failure: {}", e),
            }),
            Err(e) => Err(StoreError::BackendError {
                message: format!("keyring error for {}: {}", key, e),
            }),
        }
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(secret.expose())
            .map_err(|e| StoreError::BackendError {
                message: format!("failed to write keyring entry {}: {}", key, e),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::BackendError {
                message: format!("failed to delete keyring entry {}: {}", key, e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests tolerate platforms without a working keyring daemon.

    #[test]
    fn test_keyring_store_creation() {
        match KeyringStore::try_new("tokenrelay-test") {
            Ok(store) => assert_eq!(store.service_name, "tokenrelay-test"),
            Err(StoreError::KeyringUnavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_keyring_store_round_trip_when_available() {
        let store = match KeyringStore::try_new("tokenrelay-test-ops") {
            Ok(s) => s,
            Err(_) => return,
        };

        let key = format!(
            "test/{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        if store.set(&key, &Secret::new("test-value")).await.is_err() {
            eprintln!("Keyring set failed, skipping: backend not fully functional");
            return;
        }

        // Headless systems may accept the write without persisting it.
        if let Ok(Some(retrieved)) = store.get(&key).await {
            assert_eq!(retrieved.expose(), "test-value");
        }

        let _ = store.delete(&key).await;
    }
}
