//! Durable per-tag offsets for read-side consumers.
//!
//! The store is a consumed collaborator: `get`/`put` of one position per tag.
//! Two implementations ship with the crate: an in-memory store for tests and
//! single-node runs, and a file-backed store writing one JSON file per tag
//! with atomic tmp-then-rename updates.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CheckpointError;
use crate::journal::Position;
use crate::tag::Tag;

/// The consumed surface of the external checkpoint store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last checkpointed position for `tag`, or `None` if the tag has
    /// never been checkpointed (consume from start of stream).
    async fn get(&self, tag: Tag) -> Result<Option<Position>, CheckpointError>;

    /// Durably record that every event of `tag` up to and including
    /// `position` has been forwarded downstream.
    async fn put(&self, tag: Tag, position: Position) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    offsets: RwLock<HashMap<Tag, Position>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, tag: Tag) -> Result<Option<Position>, CheckpointError> {
        Ok(self.offsets.read().await.get(&tag).copied())
    }

    async fn put(&self, tag: Tag, position: Position) -> Result<(), CheckpointError> {
        self.offsets.write().await.insert(tag, position);
        Ok(())
    }
}

/// On-disk serialized form of one tag's checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagCheckpoint {
    tag: u32,
    position: Position,
}

/// File-backed checkpoint store: `<dir>/tag-<n>.json` per tag.
///
/// Writes go to a temporary file and are renamed into place, so a crash
/// mid-write never corrupts the previous checkpoint. A corrupt or missing
/// file reads as `None` -- the consumer rebuilds from the start of the
/// stream, which is always safe under at-least-once delivery.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }

    fn path_for(&self, tag: Tag) -> PathBuf {
        self.dir.join(format!("tag-{tag}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, tag: Tag) -> Result<Option<Position>, CheckpointError> {
        let path = self.path_for(tag);
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<TagCheckpoint>(&content) {
                Ok(checkpoint) => Ok(Some(checkpoint.position)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupt tag checkpoint, consuming from start of stream"
                    );
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, tag: Tag, position: Position) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(tag);
        let tmp_path = self.dir.join(format!("tag-{tag}.json.tmp"));
        let json = serde_json::to_string(&TagCheckpoint {
            tag: tag.0,
            position,
        })
        .map_err(io::Error::other)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrips() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.get(Tag(3)).await.unwrap(), None);

        store.put(Tag(3), Position(17)).await.unwrap();
        assert_eq!(store.get(Tag(3)).await.unwrap(), Some(Position(17)));
    }

    #[tokio::test]
    async fn file_store_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path());

        store.put(Tag(5), Position(42)).await.unwrap();
        assert_eq!(store.get(Tag(5)).await.unwrap(), Some(Position(42)));
    }

    #[tokio::test]
    async fn file_store_absent_tag_reads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.get(Tag(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_corrupt_file_reads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tag-2.json"), "not valid json!!!").expect("write");

        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.get(Tag(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_creates_its_directory_on_put() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("checkpoints").join("ledger");
        let store = FileCheckpointStore::new(&nested);

        store.put(Tag(1), Position(9)).await.unwrap();
        assert_eq!(store.get(Tag(1)).await.unwrap(), Some(Position(9)));
    }

    #[tokio::test]
    async fn later_put_overwrites_earlier_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path());

        store.put(Tag(0), Position(1)).await.unwrap();
        store.put(Tag(0), Position(2)).await.unwrap();
        assert_eq!(store.get(Tag(0)).await.unwrap(), Some(Position(2)));
    }

    #[tokio::test]
    async fn tags_are_checkpointed_independently() {
        let store = MemoryCheckpointStore::new();
        store.put(Tag(0), Position(5)).await.unwrap();
        store.put(Tag(1), Position(9)).await.unwrap();

        assert_eq!(store.get(Tag(0)).await.unwrap(), Some(Position(5)));
        assert_eq!(store.get(Tag(1)).await.unwrap(), Some(Position(9)));
    }
}
