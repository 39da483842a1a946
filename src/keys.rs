//! API key storage and the per-client credential cache.

use std::env;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::observability::KEY_FILE_READS;
use crate::provider::Provider;

/// A directory holding one key file per provider.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Creates a key store rooted at `dir`. Nothing is touched on disk.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the key files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of `provider`'s key file.
    pub fn path_for(&self, provider: Provider) -> PathBuf {
        self.dir.join(provider.key_file_name())
    }

    /// Reads `provider`'s key. The whole file is the key; surrounding
    /// whitespace is ignored.
    pub fn read(&self, provider: Provider) -> Result<String> {
        let path = self.path_for(provider);
        KEY_FILE_READS.click();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::missing_key(provider, path));
            }
            Err(err) => {
                return Err(Error::io(
                    format!("failed to read key file {}", path.display()),
                    err,
                ));
            }
        };
        let key = contents.trim();
        if key.is_empty() {
            return Err(Error::missing_key(provider, path));
        }
        Ok(key.to_string())
    }

    /// Writes `key` as `provider`'s key file, readable only by the owner.
    pub fn install(&self, provider: Provider, key: &str) -> Result<PathBuf> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::validation("API key is empty", Some("key".to_string())));
        }
        fs::create_dir_all(&self.dir).map_err(|err| {
            Error::io(
                format!("failed to create key directory {}", self.dir.display()),
                err,
            )
        })?;
        let path = self.path_for(provider);
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(|err| {
            Error::io(format!("failed to create key file {}", path.display()), err)
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(key.as_bytes())?;
        info!(provider = %provider, path = %path.display(), "installed API key");
        Ok(path)
    }
}

/// Resolves a provider's API key once and hands out the cached value after.
///
/// Lookup order: an explicit key, the provider's environment variable, then
/// the key file.
pub struct Credentials {
    provider: Provider,
    explicit: Option<String>,
    store: KeyStore,
    use_environment: bool,
    cached: OnceLock<String>,
}

impl Credentials {
    /// Creates a credential cache for `provider`.
    pub fn new(provider: Provider, explicit: Option<String>, store: KeyStore) -> Self {
        Self {
            provider,
            explicit,
            store,
            use_environment: true,
            cached: OnceLock::new(),
        }
    }

    /// Skips the environment variable during lookup.
    pub fn ignore_environment(mut self) -> Self {
        self.use_environment = false;
        self
    }

    /// Returns the key, resolving it on first use.
    pub fn resolve(&self) -> Result<&str> {
        if let Some(key) = self.cached.get() {
            return Ok(key.as_str());
        }
        let key = self.lookup()?;
        Ok(self.cached.get_or_init(|| key).as_str())
    }

    /// Returns true once a key has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.cached.get().is_some()
    }

    fn lookup(&self) -> Result<String> {
        if let Some(key) = self.explicit.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        if self.use_environment
            && let Ok(key) = env::var(self.provider.key_env_var())
            && !key.trim().is_empty()
        {
            debug!(provider = %self.provider, "using API key from environment");
            return Ok(key.trim().to_string());
        }
        debug!(
            provider = %self.provider,
            path = %self.store.path_for(self.provider).display(),
            "reading API key file"
        );
        self.store.read(self.provider)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("store", &self.store)
            .field("use_environment", &self.use_environment)
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}
