//! Result store port: durable sink for final verdicts
//!
//! The aggregator persists each verdict exactly once per correlation id.
//! `save` is an upsert so a redelivered partial that re-runs a merge
//! after a failed save cannot produce a second record.

use crate::error::{ModerationError, Result};
use crate::model::{CorrelationId, FinalVerdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// A persisted verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVerdict {
    pub correlation_id: CorrelationId,
    pub verdict: FinalVerdict,
    pub saved_at: DateTime<Utc>,
}

/// Trait for verdict persistence backends
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a verdict, replacing any previous one for the same id
    async fn save(&self, correlation_id: &CorrelationId, verdict: &FinalVerdict) -> Result<()>;

    /// Load a verdict by correlation id
    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<StoredVerdict>>;

    /// Number of stored verdicts
    async fn count(&self) -> Result<usize>;
}

/// In-memory result store for testing and single-process use
#[derive(Default)]
pub struct MemoryResultStore {
    verdicts: RwLock<HashMap<CorrelationId, StoredVerdict>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, correlation_id: &CorrelationId, verdict: &FinalVerdict) -> Result<()> {
        let stored = StoredVerdict {
            correlation_id: correlation_id.clone(),
            verdict: verdict.clone(),
            saved_at: Utc::now(),
        };
        self.verdicts
            .write()
            .await
            .insert(correlation_id.clone(), stored);
        Ok(())
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<StoredVerdict>> {
        Ok(self.verdicts.read().await.get(correlation_id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.verdicts.read().await.len())
    }
}

/// JSON file-based result store
///
/// One document per correlation id under `dir`. Writes go to a temp file
/// first and are renamed into place so readers never see a torn verdict.
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, correlation_id: &CorrelationId) -> PathBuf {
        let file_name: String = correlation_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> ModerationError {
    ModerationError::Persistence(format!("Failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn save(&self, correlation_id: &CorrelationId, verdict: &FinalVerdict) -> Result<()> {
        let stored = StoredVerdict {
            correlation_id: correlation_id.clone(),
            verdict: verdict.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&stored)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create result directory", &self.dir, e))?;

        let path = self.path_for(correlation_id);
        let tmp_path = path.with_extension("tmp");

        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| io_error("write", &tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_error("rename into", &path, e))?;

        tracing::debug!(correlation_id = %correlation_id, path = %path.display(), "Verdict written");
        Ok(())
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<StoredVerdict>> {
        let path = self.path_for(correlation_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };

        let stored = serde_json::from_str(&json).map_err(|e| {
            ModerationError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(stored))
    }

    async fn count(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error("list", &self.dir, e)),
        };

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.dir, e))?
        {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckKind, PartialResult, Severity, Violation};
    use std::collections::BTreeMap;

    fn verdict(masked: &str) -> FinalVerdict {
        let mut all_checks = BTreeMap::new();
        all_checks.insert(CheckKind::Pii, PartialResult::new(false, 0.95, masked));
        FinalVerdict {
            overall_safe: false,
            violations: vec![Violation {
                kind: CheckKind::Pii,
                severity: Severity::High,
            }],
            masked_answer: masked.to_string(),
            all_checks,
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("a3s-moderation-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_memory_store_upsert() {
        let store = MemoryResultStore::new();
        let id = CorrelationId::from("req-1");

        assert!(store.get(&id).await.unwrap().is_none());
        store.save(&id, &verdict("first")).await.unwrap();
        store.save(&id, &verdict("second")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.verdict.masked_answer, "second");
        assert_eq!(stored.correlation_id, id);
    }

    #[tokio::test]
    async fn test_file_store_save_and_get() {
        let dir = temp_dir();
        let store = FileResultStore::new(&dir);
        let id = CorrelationId::new();

        store.save(&id, &verdict("Passport ****")).await.unwrap();
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.verdict, verdict("Passport ****"));
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(!store.path_for(&id).with_extension("tmp").exists());

        let json = std::fs::read_to_string(store.path_for(&id)).unwrap();
        assert!(json.contains("\"overall_safe\": false"));
        assert!(json.contains("\"severity\": \"HIGH\""));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_overwrites() {
        let dir = temp_dir();
        let store = FileResultStore::new(&dir);
        let id = CorrelationId::from("req-2");

        store.save(&id, &verdict("a")).await.unwrap();
        store.save(&id, &verdict("b")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&id).await.unwrap().unwrap().verdict.masked_answer, "b");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_missing_dir() {
        let store = FileResultStore::new(temp_dir());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.get(&CorrelationId::from("req-x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_ids() {
        let dir = temp_dir();
        let store = FileResultStore::new(&dir);
        let id = CorrelationId::from("../escape/attempt");
        assert!(store.path_for(&id).starts_with(&dir));

        store.save(&id, &verdict("x")).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_unwritable_is_persistence_error() {
        let file = std::env::temp_dir().join(format!("a3s-moderation-file-{}", uuid::Uuid::new_v4()));
        std::fs::write(&file, "not a directory").unwrap();

        let store = FileResultStore::new(&file);
        let err = store
            .save(&CorrelationId::from("req-1"), &verdict("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModerationError::Persistence(_)));
        assert!(err.is_retryable());

        let _ = std::fs::remove_file(&file);
    }
}
