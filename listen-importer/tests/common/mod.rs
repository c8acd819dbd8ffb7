use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use listen_common::listen::{encode_line, Listen, TrackMetadata};
use listen_common::retry::RetryPolicy;
use listen_common::store::{BatchWriter, ListenStore, StoreError};
use listen_importer::config::ImportConfig;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transient,
    Rejected,
}

#[derive(Default)]
struct Inner {
    keys: HashSet<(i64, String, String)>,
    batches: Vec<Vec<Listen>>,
    failures: VecDeque<Failure>,
}

/// Listen store keeping everything in memory, with the same "skip rows already present"
/// semantics as the Postgres one.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    refuse_connections: bool,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryStore {
    /// Every `writer()` call fails.
    pub fn unreachable() -> Self {
        Self {
            refuse_connections: true,
            ..Default::default()
        }
    }

    /// Inserts wait for a permit of the returned semaphore, which starts with none.
    pub fn stalled() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        (store, gate)
    }

    /// The next inserts fail in this order before inserts succeed again.
    pub fn fail_next(&self, failures: &[Failure]) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .extend(failures.iter().copied());
    }

    /// Batches as they were successfully inserted.
    pub fn batches(&self) -> Vec<Vec<Listen>> {
        self.inner.lock().unwrap().batches.clone()
    }

    pub fn rows(&self) -> Vec<Listen> {
        self.batches().into_iter().flatten().collect()
    }
}

pub struct MemoryWriter {
    store: MemoryStore,
}

#[async_trait]
impl ListenStore for MemoryStore {
    type Writer = MemoryWriter;

    async fn writer(&self) -> Result<MemoryWriter, StoreError> {
        if self.refuse_connections {
            return Err(StoreError::Connection(sqlx::Error::PoolTimedOut));
        }
        Ok(MemoryWriter {
            store: self.clone(),
        })
    }
}

#[async_trait]
impl BatchWriter for MemoryWriter {
    async fn insert_batch(&mut self, listens: &[Listen]) -> Result<u64, StoreError> {
        if let Some(gate) = &self.store.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let mut inner = self.store.inner.lock().unwrap();
        match inner.failures.pop_front() {
            Some(Failure::Transient) => return Err(StoreError::Transient(sqlx::Error::PoolTimedOut)),
            Some(Failure::Rejected) => {
                return Err(StoreError::Rejected(
                    "invalid byte sequence for encoding \"UTF8\"".to_owned(),
                ))
            }
            None => {}
        }

        let mut inserted = 0;
        for listen in listens {
            let key = (
                listen.listened_at,
                listen.recording_id.clone(),
                listen.user_name.clone(),
            );
            if inner.keys.insert(key) {
                inserted += 1;
            }
        }
        inner.batches.push(listens.to_vec());
        Ok(inserted)
    }
}

pub fn listen(listened_at: i64, recording_id: &str, user_name: &str, track_name: &str) -> Listen {
    Listen {
        listened_at,
        recording_id: recording_id.to_owned(),
        user_name: user_name.to_owned(),
        track_metadata: TrackMetadata {
            artist_name: Some("Boards of Canada".to_owned()),
            track_name: Some(track_name.to_owned()),
            ..Default::default()
        },
    }
}

/// Render listens as a sorted dump, one line each.
pub fn dump(listens: &[Listen]) -> Vec<u8> {
    let mut out = Vec::new();
    for listen in listens {
        out.extend_from_slice(encode_line(listen).unwrap().as_bytes());
        out.push(b'\n');
    }
    out
}

/// Small, fast settings: one worker so insert order is observable, no retry delay.
pub fn test_config() -> ImportConfig {
    ImportConfig {
        worker_count: 1,
        queue_capacity: 2,
        batch_size: 2,
        idle_interval: Duration::from_millis(10),
        retry_policy: RetryPolicy::build(3, 2, Duration::from_millis(1)).jitter(Duration::ZERO),
        ..Default::default()
    }
}
