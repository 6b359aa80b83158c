//! Broker transport boundary
//!
//! The producer hands fully encoded records to a [`BrokerTransport`] from its delivery
//! worker thread. [`MemoryBroker`] keeps per-partition logs in memory and backs local
//! runs and tests; network clients implement the same trait.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;

/// Record headers as name/value pairs
pub type Headers = Vec<(String, Vec<u8>)>;

/// A record ready for the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    /// Explicit partition, or `None` to let the transport choose
    pub partition: Option<i32>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

/// Where the broker committed a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Sends records to a broker and waits for the acknowledgment
pub trait BrokerTransport: Send + Sync {
    /// Deliver one record, blocking until it is acknowledged or fails
    fn send(&self, record: &ProducedRecord) -> Result<DeliveryMetadata, TransportError>;

    /// Release connections; sends after this fail with [`TransportError::Shutdown`]
    fn close(&self) {}
}

/// A record as stored by the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

#[derive(Debug, Default)]
struct BrokerState {
    logs: HashMap<(String, i32), Vec<StoredRecord>>,
    injected_failures: VecDeque<TransportError>,
    paused: bool,
    closed: bool,
}

/// In-memory broker with per-partition append-only logs
///
/// Deliveries can be paused to hold acknowledgments back, and failures can be
/// injected for the next sends.
pub struct MemoryBroker {
    partitions: i32,
    state: Mutex<BrokerState>,
    resumed: Condvar,
}

impl MemoryBroker {
    /// Create a broker where every topic has `partitions` partitions
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(BrokerState::default()),
            resumed: Condvar::new(),
        }
    }

    /// Fail the next send with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().injected_failures.push_back(error);
    }

    /// Hold all sends until [`MemoryBroker::resume`] or close
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Release held sends
    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.resumed.notify_all();
    }

    /// Records committed to one partition, in offset order
    pub fn records(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        self.state
            .lock()
            .logs
            .get(&(topic.to_string(), partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records committed to a topic across partitions
    pub fn record_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .logs
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, log)| log.len())
            .sum()
    }

    fn choose_partition(&self, key: &[u8]) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BrokerTransport for MemoryBroker {
    fn send(&self, record: &ProducedRecord) -> Result<DeliveryMetadata, TransportError> {
        let mut state = self.state.lock();
        while state.paused && !state.closed {
            self.resumed.wait(&mut state);
        }
        if state.closed {
            return Err(TransportError::Shutdown);
        }
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }

        let partition = match record.partition {
            Some(p) if (0..self.partitions).contains(&p) => p,
            Some(p) => {
                return Err(TransportError::UnknownPartition {
                    topic: record.topic.clone(),
                    partition: p,
                })
            }
            None => self.choose_partition(&record.key),
        };

        let log = state
            .logs
            .entry((record.topic.clone(), partition))
            .or_default();
        let offset = log.len() as i64;
        log.push(StoredRecord {
            offset,
            key: record.key.clone(),
            value: record.value.clone(),
            headers: record.headers.clone(),
        });

        debug!(topic = %record.topic, partition, offset, "Committed record");
        Ok(DeliveryMetadata {
            topic: record.topic.clone(),
            partition,
            offset,
        })
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.resumed.notify_all();
    }
}
