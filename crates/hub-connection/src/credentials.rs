//! Hub credentials resolvers.
//!
//! A resolver names the hubs it holds credentials for and hands out the
//! credentials of one hub. The file-backed resolver persists them as
//! JSON:
//!
//! ```json
//! { "hubs": { "90000330": { "user": "installer", "token": "..." } } }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::HubCredentials;

/// Errors from credentials resolvers.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no credentials for hub {0}")]
    UnknownHub(String),
}

/// Source of hub credentials.
pub trait CredentialsResolver: Send + Sync {
    /// Serials of every hub this resolver knows.
    fn hubs(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>, CredentialsError>> + Send + '_>>;

    /// Credentials of one hub. Fails with
    /// [`CredentialsError::UnknownHub`] for serials it does not know.
    fn credentials<'a>(
        &'a self,
        hub_identity: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HubCredentials, CredentialsError>> + Send + 'a>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCredentials {
    user: String,
    token: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    hubs: BTreeMap<String, StoredCredentials>,
}

/// In-memory resolver.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialsResolver {
    hubs: BTreeMap<String, HubCredentials>,
}

impl StaticCredentialsResolver {
    pub fn new(credentials: impl IntoIterator<Item = HubCredentials>) -> Self {
        Self {
            hubs: credentials
                .into_iter()
                .map(|c| (c.hub_identity.clone(), c))
                .collect(),
        }
    }

    pub fn insert(&mut self, credentials: HubCredentials) {
        self.hubs
            .insert(credentials.hub_identity.clone(), credentials);
    }
}

impl CredentialsResolver for StaticCredentialsResolver {
    fn hubs(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>, CredentialsError>> + Send + '_>> {
        Box::pin(async move { Ok(self.hubs.keys().cloned().collect()) })
    }

    fn credentials<'a>(
        &'a self,
        hub_identity: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HubCredentials, CredentialsError>> + Send + 'a>> {
        Box::pin(async move {
            self.hubs
                .get(hub_identity)
                .cloned()
                .ok_or_else(|| CredentialsError::UnknownHub(hub_identity.to_string()))
        })
    }
}

/// Resolver backed by a JSON credentials file.
///
/// Entries are cached in memory and written back on every change.
pub struct FileCredentialsResolver {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, StoredCredentials>>,
}

impl FileCredentialsResolver {
    /// Loads the credentials file. A missing file yields an empty resolver.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CredentialsError> {
        let path = path.into();
        let entries = load_entries(&path)?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores credentials for a hub and persists the file.
    pub fn insert(&self, hub_identity: &str, user: &str, token: &str) -> Result<(), CredentialsError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                hub_identity.to_string(),
                StoredCredentials {
                    user: user.to_string(),
                    token: token.to_string(),
                },
            );
        self.persist()
    }

    /// Forgets a hub and persists the file. Returns whether it was known.
    pub fn remove(&self, hub_identity: &str) -> Result<bool, CredentialsError> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hub_identity)
            .is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Re-reads the file, replacing the cached entries.
    pub fn reload(&self) -> Result<(), CredentialsError> {
        let entries = load_entries(&self.path)?;
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = entries;
        Ok(())
    }

    fn lookup(&self, hub_identity: &str) -> Result<HubCredentials, CredentialsError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hub_identity)
            .map(|stored| HubCredentials {
                hub_identity: hub_identity.to_string(),
                user: stored.user.clone(),
                token: stored.token.clone(),
            })
            .ok_or_else(|| CredentialsError::UnknownHub(hub_identity.to_string()))
    }

    fn persist(&self) -> Result<(), CredentialsError> {
        let file = CredentialsFile {
            hubs: self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;

        // Tokens grant full hub access.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!("persisted {} hub credential(s) to {:?}", file.hubs.len(), self.path);
        Ok(())
    }
}

impl CredentialsResolver for FileCredentialsResolver {
    fn hubs(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>, CredentialsError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect())
        })
    }

    fn credentials<'a>(
        &'a self,
        hub_identity: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HubCredentials, CredentialsError>> + Send + 'a>> {
        Box::pin(async move { self.lookup(hub_identity) })
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, StoredCredentials>, CredentialsError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let file: CredentialsFile = serde_json::from_str(&data)?;
    debug!("loaded {} hub credential(s) from {:?}", file.hubs.len(), path);
    Ok(file.hubs)
}

/// Returns the default credentials file path.
pub fn default_credentials_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("ezlo").join("credentials.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
