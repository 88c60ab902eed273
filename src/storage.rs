//! Store credentials kept in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. `Config::load` falls
//! back to these entries when the environment does not provide them.

use keyring::Entry;
use tracing::{info, warn};

const SERVICE_NAME: &str = "order-sync";

// Credential keys
pub const KEY_STORE_URL: &str = "store_url";
pub const KEY_STORE_ANON_KEY: &str = "store_anon_key";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_STORE_URL, KEY_STORE_ANON_KEY];

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// (or the platform store is unavailable).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw).filter(|v| !v.trim().is_empty()),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), keyring::Error> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), keyring::Error> {
    match Entry::new(SERVICE_NAME, key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Persist the canonical store endpoint and key.
pub fn save_store_credentials(url: &str, anon_key: &str) -> Result<(), keyring::Error> {
    let url = crate::api::normalize_store_url(url);
    set_credential(KEY_STORE_URL, &url)?;
    set_credential(KEY_STORE_ANON_KEY, anon_key.trim())?;
    info!(store_url = %url, "store credentials updated");
    Ok(())
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<(), keyring::Error> {
    info!("deleting all store credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
