use crate::record::MailRecord;
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Destination for records of accepted messages.
pub trait RecordSink: Send + Sync {
    fn store(&self, record: &MailRecord) -> anyhow::Result<()>;
}

/// Fixed-width name a record is stored under.
pub fn record_key(id: u64) -> String {
    format!("{id:08}")
}

/// Writes each record as pretty-printed JSON to `<dir>/<key>`.
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonDirSink { dir: dir.into() }
    }

    pub fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(record_key(id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl RecordSink for JsonDirSink {
    fn store(&self, record: &MailRecord) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create save directory {}", self.dir.display()))?;

        let path = self.path_for(record.id);
        let content = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        log::debug!("[{}] saved record to {}", record.id, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ConnectionInfo;

    #[test]
    fn test_record_key_is_zero_padded() {
        assert_eq!(record_key(42), "00000042");
        assert_eq!(record_key(123456789), "123456789");
    }

    #[test]
    fn test_store_writes_json_named_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonDirSink::new(dir.path().join("spool"));

        let mut record = MailRecord::new(
            42,
            ConnectionInfo {
                ip: "198.51.100.7".to_string(),
                ..Default::default()
            },
        );
        record.add_header("Subject".to_string(), "hello".to_string());
        sink.store(&record).unwrap();

        let written = std::fs::read_to_string(dir.path().join("spool/00000042")).unwrap();
        let loaded: MailRecord = serde_json::from_str(&written).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_store_reports_unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let sink = JsonDirSink::new(&blocker);
        assert!(sink.store(&MailRecord::default()).is_err());
    }
}
