//! Mutation identifiers and the block-change event bus.
//!
//! Every PUT is stamped with a process-monotonic mutation id that is threaded
//! into every block event it emits, so downstream subscribers can coalesce
//! changes belonging to one request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::geom::BlockCoord;

static MUTATION_ID: AtomicU64 = AtomicU64::new(1);

/// Returns the next process-monotonic 64-bit mutation identifier.
pub fn next_mutation_id() -> u64 {
    MUTATION_ID.fetch_add(1, Ordering::SeqCst)
}

/// A change to one block, published after the underlying write is durable.
/// Payloads carry the flat label volumes of the block.
#[derive(Clone, Debug)]
pub enum BlockEvent {
    Ingest {
        block: BlockCoord,
        data: Arc<Vec<u64>>,
        mutation: u64,
    },
    Mutate {
        block: BlockCoord,
        prev: Option<Arc<Vec<u64>>>,
        data: Arc<Vec<u64>>,
        mutation: u64,
    },
}

impl BlockEvent {
    pub fn block(&self) -> BlockCoord {
        match self {
            BlockEvent::Ingest { block, .. } | BlockEvent::Mutate { block, .. } => *block,
        }
    }

    pub fn mutation(&self) -> u64 {
        match self {
            BlockEvent::Ingest { mutation, .. } | BlockEvent::Mutate { mutation, .. } => *mutation,
        }
    }
}

/// A synchronous block-event subscriber. Subscribers may block the publisher;
/// delivery happens only after the underlying KV write is durable (for
/// buffered writes, after the buffer's completion callback fires).
pub trait SyncSubscriber: Send + Sync {
    fn notify(&self, event: &BlockEvent);
}

/// Fan-out of block events to registered subscribers.
#[derive(Default)]
pub struct SyncBus {
    subscribers: RwLock<Vec<Arc<dyn SyncSubscriber>>>,
}

impl SyncBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn SyncSubscriber>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    pub fn publish(&self, event: &BlockEvent) {
        for subscriber in self.subscribers.read().unwrap().iter() {
            subscriber.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_mutation_ids_monotonic() {
        let a = next_mutation_id();
        let b = next_mutation_id();
        assert!(b > a);
    }

    struct Recorder(Mutex<Vec<u64>>);

    impl SyncSubscriber for Recorder {
        fn notify(&self, event: &BlockEvent) {
            self.0.lock().unwrap().push(event.mutation());
        }
    }

    #[test]
    fn test_bus_delivers_to_all_subscribers() {
        let bus = SyncBus::new();
        let a = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.publish(&BlockEvent::Ingest {
            block: BlockCoord::new(0, 0, 0),
            data: Arc::new(vec![0; 8]),
            mutation: 99,
        });

        assert_eq!(*a.0.lock().unwrap(), vec![99]);
        assert_eq!(*b.0.lock().unwrap(), vec![99]);
    }
}
