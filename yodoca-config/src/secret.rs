//! Secret resolution: per-OS keyring namespaced to `yodoca`, falling back to
//! environment variables.

use thiserror::Error;

/// Keyring service namespace used for all yodoca secrets.
const SERVICE_NAME: &str = "yodoca";

/// Result alias for secret store operations.
pub type SecretResult<T> = Result<T, SecretError>;

/// Errors raised while resolving a secret.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The underlying OS keyring returned an unexpected error.
    #[error("keyring error resolving `{name}`: {source}")]
    Keyring {
        /// Name of the secret being resolved.
        name: String,
        /// Underlying keyring error.
        #[source]
        source: keyring::Error,
    },
}

/// Resolves a named secret value. Implementations must never log the
/// resolved value.
pub trait SecretStore: Send + Sync {
    /// Resolves `name`, returning `None` if it cannot be found anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError`] if an underlying resolution mechanism failed
    /// unexpectedly (as opposed to simply not having the secret).
    fn get_secret(&self, name: &str) -> SecretResult<Option<String>>;
}

/// Default secret store: OS keyring first, environment variable fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringSecretStore;

impl SecretStore for KeyringSecretStore {
    fn get_secret(&self, name: &str) -> SecretResult<Option<String>> {
        let entry = keyring::Entry::new(SERVICE_NAME, name).map_err(|source| SecretError::Keyring {
            name: name.to_owned(),
            source,
        })?;

        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(std::env::var(name).ok()),
            Err(source) => Err(SecretError::Keyring {
                name: name.to_owned(),
                source,
            }),
        }
    }
}

/// Secret store reading only from environment variables, for tests and for
/// sandboxes without a usable OS keyring backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, name: &str) -> SecretResult<Option<String>> {
        Ok(std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_store_reads_process_environment() {
        // SAFETY: test runs single-threaded within this process; no other
        // test in this crate reads or writes this variable.
        unsafe {
            std::env::set_var("YODOCA_TEST_SECRET", "shh");
        }
        let store = EnvSecretStore;
        assert_eq!(
            store.get_secret("YODOCA_TEST_SECRET").unwrap(),
            Some("shh".to_owned())
        );
        unsafe {
            std::env::remove_var("YODOCA_TEST_SECRET");
        }
    }

    #[test]
    fn env_store_returns_none_when_absent() {
        let store = EnvSecretStore;
        assert_eq!(store.get_secret("YODOCA_DEFINITELY_NOT_SET").unwrap(), None);
    }
}
