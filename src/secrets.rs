use keyring::{Entry, Error as KeyringError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const KEYRING_SERVICE: &str = "com.gitlab-tray.desktop";

/// Keys of the persisted key-value state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    AccessToken,
    RefreshToken,
    UserId,
    Username,
    Host,
    CustomCertPath,
    Plan,
    Bookmarks,
}

impl StoreKey {
    /// Keys wiped on logout. Bookmarks outlive the session.
    pub const SESSION: [StoreKey; 7] = [
        StoreKey::AccessToken,
        StoreKey::RefreshToken,
        StoreKey::UserId,
        StoreKey::Username,
        StoreKey::Host,
        StoreKey::CustomCertPath,
        StoreKey::Plan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::AccessToken => "access_token",
            StoreKey::RefreshToken => "refresh_token",
            StoreKey::UserId => "user_id",
            StoreKey::Username => "username",
            StoreKey::Host => "host",
            StoreKey::CustomCertPath => "custom_cert_path",
            StoreKey::Plan => "plan",
            StoreKey::Bookmarks => "bookmarks",
        }
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: StoreKey) -> Result<Option<String>, String>;
    fn set(&self, key: StoreKey, value: &str) -> Result<(), String>;
    fn delete(&self, key: StoreKey) -> Result<(), String>;
}

/// OS keyring backend: one entry per key under a single service name.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: StoreKey) -> Result<Entry, String> {
        Entry::new(&self.service, key.as_str())
            .map_err(|err| format!("Failed to open keyring entry {}: {err}", key.as_str()))
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>, String> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(err) => Err(format!("Failed to read {} from keyring: {err}", key.as_str())),
        }
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<(), String> {
        self.entry(key)?
            .set_password(value)
            .map_err(|err| format!("Failed to store {} in keyring: {err}", key.as_str()))
    }

    fn delete(&self, key: StoreKey) -> Result<(), String> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(err) => Err(format!("Failed to delete {} from keyring: {err}", key.as_str())),
        }
    }
}

/// Process-local backend, used by tests and when no keyring is reachable.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<StoreKey, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>, String> {
        let values = self.values.lock().map_err(|err| err.to_string())?;
        Ok(values.get(&key).cloned())
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<(), String> {
        let mut values = self.values.lock().map_err(|err| err.to_string())?;
        values.insert(key, value.to_string());
        Ok(())
    }

    fn delete(&self, key: StoreKey) -> Result<(), String> {
        let mut values = self.values.lock().map_err(|err| err.to_string())?;
        values.remove(&key);
        Ok(())
    }
}

/// Everything needed to talk to the API on the user's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub host: String,
    pub custom_cert_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProfile {
    pub user_id: u64,
    pub username: String,
    pub plan: Option<String>,
}

#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub fn get(&self, key: StoreKey) -> Result<Option<String>, String> {
        Ok(self
            .inner
            .get(key)?
            .filter(|value| !value.trim().is_empty()))
    }

    pub fn set(&self, key: StoreKey, value: &str) -> Result<(), String> {
        self.inner.set(key, value)
    }

    pub fn delete(&self, key: StoreKey) -> Result<(), String> {
        self.inner.delete(key)
    }

    /// Returns stored credentials when both an access token and a host exist.
    pub fn credentials(&self) -> Result<Option<Credentials>, String> {
        let (Some(access_token), Some(host)) =
            (self.get(StoreKey::AccessToken)?, self.get(StoreKey::Host)?)
        else {
            return Ok(None);
        };
        Ok(Some(Credentials {
            access_token,
            refresh_token: self.get(StoreKey::RefreshToken)?,
            host,
            custom_cert_path: self.get(StoreKey::CustomCertPath)?,
        }))
    }

    pub fn save_credentials(&self, credentials: &Credentials) -> Result<(), String> {
        self.set(StoreKey::AccessToken, &credentials.access_token)?;
        match &credentials.refresh_token {
            Some(token) => self.set(StoreKey::RefreshToken, token)?,
            None => self.delete(StoreKey::RefreshToken)?,
        }
        self.set(StoreKey::Host, &credentials.host)?;
        match &credentials.custom_cert_path {
            Some(path) => self.set(StoreKey::CustomCertPath, path),
            None => self.delete(StoreKey::CustomCertPath),
        }
    }

    pub fn save_tokens(&self, access_token: &str, refresh_token: &str) -> Result<(), String> {
        self.set(StoreKey::AccessToken, access_token)?;
        self.set(StoreKey::RefreshToken, refresh_token)
    }

    pub fn save_profile(&self, profile: &StoredProfile) -> Result<(), String> {
        self.set(StoreKey::UserId, &profile.user_id.to_string())?;
        self.set(StoreKey::Username, &profile.username)?;
        match &profile.plan {
            Some(plan) => self.set(StoreKey::Plan, plan),
            None => self.delete(StoreKey::Plan),
        }
    }

    pub fn profile(&self) -> Result<Option<StoredProfile>, String> {
        let user_id = self
            .get(StoreKey::UserId)?
            .and_then(|value| value.parse::<u64>().ok());
        let (Some(user_id), Some(username)) = (user_id, self.get(StoreKey::Username)?) else {
            return Ok(None);
        };
        Ok(Some(StoredProfile {
            user_id,
            username,
            plan: self.get(StoreKey::Plan)?,
        }))
    }

    /// Deletes every session key. Keeps going past individual failures so a
    /// broken entry cannot leave the rest of the session behind.
    pub fn clear_session(&self) -> Result<(), String> {
        let failures: Vec<String> = StoreKey::SESSION
            .iter()
            .filter_map(|key| self.delete(*key).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}
