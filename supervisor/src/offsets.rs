use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use consumer_supervisor::{Error, Result};
use serde::{Deserialize, Serialize};

/// Offset reported for a topic that has not handled any message yet.
pub(crate) const NO_OFFSET: i64 = -1;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct StoredOffset {
    topic: String,
    partition: i32,
    offset: i64,
}

/// Keeps the last handled offset of each topic in `<dir>/<topic>.<partition>.offset.json`.
#[derive(Debug, Clone)]
pub(crate) struct OffsetStore {
    dir: PathBuf,
    partition: i32,
}

impl OffsetStore {
    pub(crate) fn new(dir: impl Into<PathBuf>, partition: i32) -> Self {
        Self {
            dir: dir.into(),
            partition,
        }
    }

    fn path(&self, topic: &str) -> PathBuf {
        self.dir
            .join(format!("{topic}.{}.offset.json", self.partition))
    }

    pub(crate) async fn load(&self, topic: &str) -> Result<i64> {
        let path = self.path(topic);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(NO_OFFSET),
            Err(e) => {
                return Err(Error::OffsetSource(format!(
                    "Reading {}: {e}",
                    path.display()
                )));
            }
        };

        let stored: StoredOffset = serde_json::from_slice(&contents).map_err(|e| {
            Error::OffsetSource(format!("Parsing {}: {e}", path.display()))
        })?;
        if stored.topic != topic || stored.partition != self.partition {
            return Err(Error::OffsetSource(format!(
                "{} belongs to {}[{}]",
                path.display(),
                stored.topic,
                stored.partition
            )));
        }
        Ok(stored.offset)
    }

    /// Replaces the stored offset. The file is written next to the target and renamed over
    /// it, so a reader never sees a partial write.
    pub(crate) async fn save(&self, topic: &str, offset: i64) -> Result<()> {
        let stored = StoredOffset {
            topic: topic.to_string(),
            partition: self.partition,
            offset,
        };
        let contents = serde_json::to_vec(&stored)
            .map_err(|e| Error::Handler(format!("Encoding offset of {topic}: {e}")))?;

        let path = self.path(topic);
        let tmp_path = path.with_extension("json.tmp");
        write_then_rename(&tmp_path, &path, &contents)
            .await
            .map_err(|e| Error::Handler(format!("Writing {}: {e}", path.display())))
    }
}

async fn write_then_rename(tmp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp_path, contents).await?;
    tokio::fs::rename(tmp_path, path).await
}
