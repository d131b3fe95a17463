const SERVICE_NAME: &str = "com.gengo.app";
const API_KEY_ACCOUNT: &str = "llm_api_key";

pub fn read_api_key() -> Result<Option<String>, String> {
    let entry =
        keyring::Entry::new(SERVICE_NAME, API_KEY_ACCOUNT).map_err(|err| err.to_string())?;

    match entry.get_password() {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) if is_not_found_error(&err.to_string()) => Ok(None),
        Err(err) => Err(format!("failed to read API key from secure storage: {err}")),
    }
}

/// Stores the key, or clears the entry when `api_key` is blank.
pub fn write_api_key(api_key: &str) -> Result<(), String> {
    let entry =
        keyring::Entry::new(SERVICE_NAME, API_KEY_ACCOUNT).map_err(|err| err.to_string())?;
    let trimmed = api_key.trim();

    if trimmed.is_empty() {
        return match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) if is_not_found_error(&err.to_string()) => Ok(()),
            Err(err) => Err(format!("failed to clear API key in secure storage: {err}")),
        };
    }

    entry
        .set_password(trimmed)
        .map_err(|err| format!("failed to save API key in secure storage: {err}"))
}

/// Writes the key and reads it back; some keyring backends accept writes
/// that never persist.
pub fn write_api_key_verified(api_key: &str) -> Result<(), String> {
    write_api_key(api_key)?;
    let stored = read_api_key()?.unwrap_or_default();
    if stored.trim() == api_key.trim() {
        Ok(())
    } else {
        Err("secure storage did not retain the API key".to_string())
    }
}

/// Where the API key lives between runs.
pub trait ApiKeyStore: Send + Sync {
    fn read(&self) -> Result<Option<String>, String>;
    /// Stores (or clears, when blank) the key and confirms it persisted.
    fn write_verified(&self, api_key: &str) -> Result<(), String>;
}

/// The OS credential store.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl ApiKeyStore for KeyringStore {
    fn read(&self) -> Result<Option<String>, String> {
        read_api_key()
    }

    fn write_verified(&self, api_key: &str) -> Result<(), String> {
        if api_key.trim().is_empty() {
            write_api_key(api_key)
        } else {
            write_api_key_verified(api_key)
        }
    }
}

fn is_not_found_error(message: &str) -> bool {
    let normalized = message.to_lowercase();
    normalized.contains("no entry")
        || normalized.contains("not found")
        || normalized.contains("no matching entry")
}
