use crate::error::AgentResult;
use common::domain::TelemetryEnvelope;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default cap on buffered readings; the oldest are discarded first.
pub const DEFAULT_BUFFER_MAX_ENTRIES: usize = 100;

/// Envelopes waiting for the gateway, one JSON document per line.
///
/// All access goes through one lock so a flush and a concurrent append
/// never overwrite each other.
pub struct LocalBuffer {
    path: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl LocalBuffer {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add one envelope, discarding the oldest entries past the cap.
    /// Returns the number of buffered envelopes.
    pub async fn append(&self, envelope: &TelemetryEnvelope) -> AgentResult<usize> {
        let _guard = self.lock.lock().await;

        let mut entries = self.read_entries().await?;
        if entries.len() < self.max_entries {
            let mut line = serde_json::to_string(envelope)?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            return Ok(entries.len() + 1);
        }

        entries.push(envelope.clone());
        let overflow = entries.len() - self.max_entries;
        entries.drain(..overflow);
        warn!(discarded = overflow, "local buffer full, oldest readings discarded");
        self.write_entries(&entries).await?;
        Ok(entries.len())
    }

    pub async fn len(&self) -> AgentResult<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.read_entries().await?.len())
    }

    pub async fn is_empty(&self) -> AgentResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Everything buffered, oldest first. The file is left untouched so a
    /// crash mid-flush loses nothing.
    pub async fn entries(&self) -> AgentResult<Vec<TelemetryEnvelope>> {
        let _guard = self.lock.lock().await;
        self.read_entries().await
    }

    /// Remove the oldest entry equal to `envelope` once it has been
    /// delivered. Returns false if it was already gone, e.g. evicted by the cap.
    pub async fn remove(&self, envelope: &TelemetryEnvelope) -> AgentResult<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        let Some(index) = entries.iter().position(|e| e == envelope) else {
            return Ok(false);
        };
        entries.remove(index);
        self.write_entries(&entries).await?;
        Ok(true)
    }

    async fn read_entries(&self) -> AgentResult<Vec<TelemetryEnvelope>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // A torn write leaves at most one bad line; skip it rather than block the buffer
            match serde_json::from_str(line) {
                Ok(envelope) => entries.push(envelope),
                Err(e) => warn!(line = index + 1, error = %e, "skipping corrupt buffer line"),
            }
        }
        Ok(entries)
    }

    async fn write_entries(&self, entries: &[TelemetryEnvelope]) -> AgentResult<()> {
        if entries.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let mut contents = String::new();
        for envelope in entries {
            contents.push_str(&serde_json::to_string(envelope)?);
            contents.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(entries = entries.len(), "local buffer rewritten");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::Metric;

    fn envelope(power: f64) -> TelemetryEnvelope {
        TelemetryEnvelope {
            version: "1.0".to_string(),
            device_id: "dev-001".to_string(),
            ts: "2024-01-01T00:00:00.000Z".to_string(),
            metrics: vec![Metric {
                name: "power_active_w".to_string(),
                value: power,
                unit: "W".to_string(),
            }],
            tags: None,
        }
    }

    fn buffer_in(dir: &tempfile::TempDir, max_entries: usize) -> LocalBuffer {
        LocalBuffer::new(dir.path().join("buffer.jsonl"), max_entries)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);

        assert!(buffer.is_empty().await.unwrap());
        assert!(buffer.entries().await.unwrap().is_empty());
    }

    async fn powers(buffer: &LocalBuffer) -> Vec<f64> {
        buffer
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.metrics[0].value)
            .collect()
    }

    #[tokio::test]
    async fn test_entries_preserve_order_and_leave_file_in_place() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);

        // Act
        for power in [1.0, 2.0, 3.0] {
            buffer.append(&envelope(power)).await.unwrap();
        }

        // Assert
        assert_eq!(powers(&buffer).await, vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_remove_deletes_only_the_delivered_entry() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        for power in [1.0, 2.0, 3.0] {
            buffer.append(&envelope(power)).await.unwrap();
        }

        // Act
        let removed = buffer.remove(&envelope(2.0)).await.unwrap();
        let removed_again = buffer.remove(&envelope(2.0)).await.unwrap();

        // Assert
        assert!(removed);
        assert!(!removed_again);
        assert_eq!(powers(&buffer).await, vec![1.0, 3.0]);
    }

    #[tokio::test]
    async fn test_removing_last_entry_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        buffer.append(&envelope(1.0)).await.unwrap();

        buffer.remove(&envelope(1.0)).await.unwrap();

        assert!(buffer.is_empty().await.unwrap());
        assert!(!buffer.path().exists());
    }

    #[tokio::test]
    async fn test_cap_discards_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 2);

        buffer.append(&envelope(1.0)).await.unwrap();
        buffer.append(&envelope(2.0)).await.unwrap();
        let count = buffer.append(&envelope(3.0)).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(powers(&buffer).await, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        buffer.append(&envelope(1.0)).await.unwrap();
        let mut contents = std::fs::read_to_string(buffer.path()).unwrap();
        contents.push_str("{\"version\": \"1.0\", \"dev\n");
        std::fs::write(buffer.path(), contents).unwrap();

        assert_eq!(buffer.len().await.unwrap(), 1);
    }
}
