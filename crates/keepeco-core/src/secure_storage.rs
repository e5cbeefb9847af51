use crate::secret::Secret;
use keyring::Entry;

/// Account name under which every database secret is filed.
pub const DEFAULT_ACCOUNT: &str = "keepeco";

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("no matching item found in the keystore")]
    NotFound,
    #[error("keystore is not available on this platform: {0}")]
    Unsupported(String),
    #[error("keystore: {0}")]
    Backend(String),
}

/// Secret persistence keyed by service name (the database path).
pub trait Keystore: Send + Sync {
    fn get(&self, service: &str) -> Result<Secret, KeystoreError>;
    fn set(&self, service: &str, secret: &Secret) -> Result<(), KeystoreError>;
}

/// OS keyring (Keychain, Secret Service, Credential Manager).
#[derive(Debug, Clone)]
pub struct KeyringStore {
    account: String,
}

impl KeyringStore {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self, service: &str) -> Result<Entry, KeystoreError> {
        Entry::new(service, &self.account).map_err(map_keyring_error)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_ACCOUNT)
    }
}

impl Keystore for KeyringStore {
    fn get(&self, service: &str) -> Result<Secret, KeystoreError> {
        let password = self
            .entry(service)?
            .get_password()
            .map_err(map_keyring_error)?;
        Ok(Secret::new(password))
    }

    fn set(&self, service: &str, secret: &Secret) -> Result<(), KeystoreError> {
        self.entry(service)?
            .set_password(secret.expose())
            .map_err(map_keyring_error)
    }
}

fn map_keyring_error(err: keyring::Error) -> KeystoreError {
    match err {
        keyring::Error::NoEntry => KeystoreError::NotFound,
        keyring::Error::PlatformFailure(e) | keyring::Error::NoStorageAccess(e) => {
            KeystoreError::Unsupported(e.to_string())
        }
        other => KeystoreError::Backend(other.to_string()),
    }
}

/// Never remembers anything; every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKeystore;

impl Keystore for NullKeystore {
    fn get(&self, _service: &str) -> Result<Secret, KeystoreError> {
        Err(KeystoreError::NotFound)
    }

    fn set(&self, _service: &str, _secret: &Secret) -> Result<(), KeystoreError> {
        Ok(())
    }
}
