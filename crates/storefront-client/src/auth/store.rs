use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The store key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// The store key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// The store key of the estimated access token expiry, in milliseconds since the unix epoch.
pub const TOKEN_EXPIRY_KEY: &str = "token_expiry";

/// A persisted key-value store holding the session tokens across restarts.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> io::Result<()>;

    fn remove(&self, key: &str) -> io::Result<()>;
}

type Values = BTreeMap<String, String>;

fn lock(values: &Mutex<Values>) -> MutexGuard<'_, Values> {
    values.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`TokenStore`] that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<Values>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        lock(&self.values).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// A [`TokenStore`] backed by a JSON file.
///
/// The file is read once when opening the store and rewritten as a whole on every change. Writes
/// go to a temporary file in the same directory first, which then replaces the previous file, so
/// readers never observe a partially written session.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    values: Mutex<Values>,
}

impl FileTokenStore {
    /// Opens the store at `path`. A missing file is treated as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(contents) if contents.iter().all(u8::is_ascii_whitespace) => Values::new(),
            Ok(contents) => serde_json::from_slice(&contents)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Values::new(),
            Err(err) => return Err(err),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &Values) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, values)?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut values = lock(&self.values);
        values.insert(key.to_owned(), value.to_owned());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let mut values = lock(&self.values);
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
