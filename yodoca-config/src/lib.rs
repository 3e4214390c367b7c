//! Settings file, secret store, and sandbox filesystem layout for the
//! yodoca runtime.

#![warn(missing_docs, clippy::pedantic)]

mod secret;
mod settings;

pub use secret::{EnvSecretStore, KeyringSecretStore, SecretError, SecretResult, SecretStore};
pub use settings::{
    AgentSettings, ConfiguredState, ProviderSettings, SessionSettings, Settings, SettingsError,
    SettingsResult, TaskEngineSettings, DEFAULT_AGENT_ID,
};

use std::path::{Path, PathBuf};

/// Relative path, under the sandbox root, to the settings file.
pub const SETTINGS_RELATIVE_PATH: &str = "config/settings.yaml";

/// Relative path, under the sandbox root, to the restart-request flag file.
pub const RESTART_FLAG_RELATIVE_PATH: &str = ".restart_requested";

/// Resolves filesystem paths rooted at a sandbox directory.
#[derive(Clone, Debug)]
pub struct SandboxPaths {
    root: PathBuf,
}

impl SandboxPaths {
    /// Creates a new path resolver rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the sandbox root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path to `config/settings.yaml`.
    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_RELATIVE_PATH)
    }

    /// Returns the path to the extensions directory.
    #[must_use]
    pub fn extensions_dir(&self) -> PathBuf {
        self.root.join("extensions")
    }

    /// Returns the per-extension private data directory, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn data_dir(&self, extension_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.root.join("data").join(extension_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Returns the path to a core, kernel-owned SQLite database file under
    /// `<sandbox>/data/`, creating the directory if absent. Used for
    /// `event_bus.sqlite` and `task_engine.sqlite`, distinct from
    /// per-extension `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn core_db(&self, file_name: &str) -> std::io::Result<PathBuf> {
        let dir = self.root.join("data");
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(file_name))
    }

    /// Returns the path to the restart-request flag file.
    #[must_use]
    pub fn restart_flag(&self) -> PathBuf {
        self.root.join(RESTART_FLAG_RELATIVE_PATH)
    }

    /// Returns `true` if the restart-request flag file is present, deleting it
    /// as a side effect (the flag is consumed once observed).
    #[must_use]
    pub fn take_restart_requested(&self) -> bool {
        let flag = self.restart_flag();
        if flag.exists() {
            let _ = std::fs::remove_file(&flag);
            true
        } else {
            false
        }
    }

    /// Writes the restart-request flag file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn request_restart(&self) -> std::io::Result<()> {
        std::fs::write(self.restart_flag(), b"1")
    }
}
