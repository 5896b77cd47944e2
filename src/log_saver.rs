//! Persisting log artifacts produced during a run.
//!
//! A [`LogSaver`] is the one object shared (and mutated) by every shard of an
//! invocation. Implementations must accept concurrent calls; the
//! [`FileLogSaver`] serializes writes per log name and lets saves under
//! different names proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SuiteError, SuiteResult};

/// Kind of data carried by a log artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDataType {
    Text,
    Logcat,
    Bugreport,
    Png,
    Unknown,
}

impl LogDataType {
    /// File extension used when the artifact is written to disk.
    pub fn file_extension(&self) -> &'static str {
        match self {
            LogDataType::Text | LogDataType::Logcat => "txt",
            LogDataType::Bugreport => "zip",
            LogDataType::Png => "png",
            LogDataType::Unknown => "dat",
        }
    }
}

/// A saved log artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Where the artifact was written.
    pub path: PathBuf,
    /// Canonical URL for the artifact.
    pub url: String,
    /// Kind of data stored.
    pub data_type: LogDataType,
}

/// Stores log artifacts and returns where they ended up.
///
/// Must be safe for concurrent invocation from multiple shards.
#[async_trait]
pub trait LogSaver: Send + Sync {
    async fn save_log_data(
        &self,
        name: &str,
        data_type: LogDataType,
        data: &[u8],
    ) -> SuiteResult<LogFile>;
}

/// Writes log artifacts under a root directory.
///
/// Each save creates a uniquely named file `<name>_<uuid>.<ext>`. Saves under
/// the same `name` are serialized through a per-name lock.
pub struct FileLogSaver {
    root: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLogSaver {
    /// Creates a saver writing under `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, name: &str) -> SuiteResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .key_locks
            .lock()
            .map_err(|_| SuiteError::Harness("log saver lock poisoned".to_string()))?;
        Ok(locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}

#[async_trait]
impl LogSaver for FileLogSaver {
    async fn save_log_data(
        &self,
        name: &str,
        data_type: LogDataType,
        data: &[u8],
    ) -> SuiteResult<LogFile> {
        let key_lock = self.lock_for(name)?;
        let _guard = key_lock.lock().await;

        tokio::fs::create_dir_all(&self.root).await?;

        let file_name = format!(
            "{}_{}.{}",
            sanitize_file_name(name),
            uuid::Uuid::new_v4(),
            data_type.file_extension()
        );
        let path = self.root.join(file_name);
        tokio::fs::write(&path, data).await?;

        debug!("Saved log {} ({} bytes) to {}", name, data.len(), path.display());

        let url = format!("file://{}", path.display());
        Ok(LogFile {
            path,
            url,
            data_type,
        })
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}
