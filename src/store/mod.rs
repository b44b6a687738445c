pub mod memory;

pub use memory::Memory;

use std::sync::mpsc;

use crate::error::Result;

/// An ordered key-value store. The core depends only on lexicographic
/// ordering of byte keys; the engine itself is an external collaborator and
/// must be concurrency-safe.
pub trait KeyStore: Send + Sync + 'static {
    /// Retrieves the value for a given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Inserts or updates a key-value pair.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Removes a key-value pair. Removing a missing key is a no-op.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Returns all key-value pairs in the inclusive range [start, end],
    /// ordered by key.
    fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Returns all key-value pairs starting with the given prefix.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        // Successor of the prefix: bump the last non-0xff byte. Every key
        // with the prefix sorts strictly below it.
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => {
                let mut end = prefix[..=i].to_vec();
                end[i] += 1;
                end
            }
            None => vec![0xff; prefix.len() + 9],
        };
        let mut out = self.scan(prefix, &end)?;
        out.retain(|(k, _)| k.starts_with(prefix));
        Ok(out)
    }

    /// Applies a batch of puts (Some) and deletes (None) atomically if the
    /// engine supports it, else sequentially.
    fn write_batch(&self, batch: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> Result<()> {
        for (key, value) in batch {
            match value {
                Some(value) => self.put(&key, value)?,
                None => self.delete(&key)?,
            }
        }
        Ok(())
    }

    /// Optional buffered-write interface. Engines that batch writes
    /// internally return a buffer whose `put_callback` signals durability on
    /// a ready channel; everyone else returns None and callers fall back to
    /// direct puts.
    fn request_buffer(&self) -> Option<Box<dyn RequestBuffer>> {
        None
    }
}

/// Buffered writes with completion callbacks. Event publication is gated on
/// the ready signal so subscribers only observe durable block changes.
pub trait RequestBuffer: Send {
    /// Queues a write. Exactly one Result is later delivered on `ready`.
    fn put_callback(&mut self, key: Vec<u8>, value: Vec<u8>, ready: mpsc::Sender<Result<()>>);

    /// Flushes all queued writes, firing their ready channels.
    fn flush(&mut self) -> Result<()>;
}
