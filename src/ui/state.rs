use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unable to serialize page state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unable to compress page state: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Page state fingerprint does not match its contents")]
    Corrupted,
}

/// Serialized page state: gzip-compressed JSON plus the SHA-256 of the JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    data: Vec<u8>,
    fingerprint: String,
}

impl Snapshot {
    pub fn capture<T: Serialize>(value: &T) -> Result<Self, StateError> {
        let json = serde_json::to_vec(value)?;
        Ok(Self {
            data: compress(&json)?,
            fingerprint: fingerprint(&json),
        })
    }

    pub fn restore<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        let json = decompress(&self.data)?;
        if fingerprint(&json) != self.fingerprint {
            return Err(StateError::Corrupted);
        }
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Compressed size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

fn fingerprint(json: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json);
    hex::encode(hasher.finalize())
}

fn compress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

#[derive(Clone, Debug)]
struct StateEntry {
    snapshot: Snapshot,
    last_accessed: Instant,
}

/// In-memory page state per visitor, expired after a period without access.
#[derive(Clone, Debug)]
pub struct VisitorStore {
    /// Entries keyed by (visitor, page id)
    entries: Arc<RwLock<HashMap<(Uuid, String), StateEntry>>>,
    ttl: Duration,
}

impl VisitorStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get(&self, visitor: Uuid, key: &str) -> Option<Snapshot> {
        let mut entries = self.entries.write().await;
        let id = (visitor, key.to_string());

        let entry = entries.get_mut(&id)?;
        if entry.last_accessed.elapsed() > self.ttl {
            entries.remove(&id);
            return None;
        }
        entry.last_accessed = Instant::now();
        Some(entry.snapshot.clone())
    }

    pub async fn put(&self, visitor: Uuid, key: &str, snapshot: Snapshot) {
        self.entries.write().await.insert(
            (visitor, key.to_string()),
            StateEntry {
                snapshot,
                last_accessed: Instant::now(),
            },
        );
    }

    pub async fn remove(&self, visitor: Uuid, key: &str) -> Option<Snapshot> {
        self.entries
            .write()
            .await
            .remove(&(visitor, key.to_string()))
            .map(|entry| entry.snapshot)
    }

    /// Drops expired entries and returns how many went.
    pub async fn clear_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.last_accessed.elapsed() <= ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for VisitorStore {
    /// 30 minutes, the usual servlet session timeout.
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Listing {
        first: u64,
        sort: Option<String>,
    }

    fn listing() -> Listing {
        Listing {
            first: 20,
            sort: Some("name".to_string()),
        }
    }

    #[test]
    fn test_snapshot_restores_what_was_captured() {
        let snapshot = Snapshot::capture(&listing()).unwrap();
        assert_eq!(snapshot.fingerprint().len(), 64);
        assert_eq!(snapshot.restore::<Listing>().unwrap(), listing());
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let mut snapshot = Snapshot::capture(&listing()).unwrap();
        snapshot.fingerprint = Snapshot::capture(&Listing {
            first: 0,
            sort: None,
        })
        .unwrap()
        .fingerprint;
        assert!(matches!(
            snapshot.restore::<Listing>(),
            Err(StateError::Corrupted)
        ));

        let mut snapshot = Snapshot::capture(&listing()).unwrap();
        snapshot.data.truncate(4);
        assert!(matches!(
            snapshot.restore::<Listing>(),
            Err(StateError::Compression(_))
        ));
    }

    #[tokio::test]
    async fn test_store_is_keyed_by_visitor_and_page() {
        let store = VisitorStore::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let snapshot = Snapshot::capture(&listing()).unwrap();

        store.put(alice, "people", snapshot.clone()).await;
        assert_eq!(store.get(alice, "people").await, Some(snapshot.clone()));
        assert_eq!(store.get(alice, "company").await, None);
        assert_eq!(store.get(bob, "people").await, None);

        assert_eq!(store.remove(alice, "people").await, Some(snapshot));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let store = VisitorStore::new(Duration::from_millis(10));
        let visitor = Uuid::new_v4();
        store
            .put(visitor, "people", Snapshot::capture(&listing()).unwrap())
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.clear_expired().await, 1);
        assert_eq!(store.len().await, 0);
    }
}
