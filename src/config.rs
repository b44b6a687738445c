use crate::geom::Point3d;

/// Default cuboid block dimensions.
pub const DEFAULT_BLOCK_SIZE: i32 = 64;

/// Number of label shards; each shard serializes read-modify-write of the
/// label Metas routed to it by `label % num_label_handlers`.
pub const DEFAULT_LABEL_HANDLERS: usize = 32;

/// Size of the sparse-volume block decoder pool.
pub const DEFAULT_BLOCK_DECODERS: usize = 10;

/// Per-shard Meta cache capacity in labels.
pub const DEFAULT_META_CACHE_SIZE: usize = 100;
const MIN_META_CACHE_SIZE: usize = 50;

/// Concurrent block-chunk tasks allowed across one PUT.
pub const DEFAULT_HANDLER_TOKENS: usize = 8;

/// Capacity of the block-change aggregation channel.
pub const DEFAULT_BLOCK_CHANGE_BUFFER: usize = 100;

/// Configuration for a label data instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block dimensions in voxels (default: 64x64x64)
    pub block_size: Point3d,

    /// Number of label index shards (default: 32)
    pub num_label_handlers: usize,

    /// Number of sparse-volume decode workers (default: 10)
    pub block_decoders: usize,

    /// Per-shard Meta cache capacity; values below 50 are raised to 50
    pub meta_cache_size: usize,

    /// Counted-semaphore size gating concurrent block-chunk tasks (default: 8)
    pub handler_tokens: usize,

    /// Buffer capacity of the block-change channel (default: 100)
    pub block_change_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: Point3d([DEFAULT_BLOCK_SIZE; 3]),
            num_label_handlers: DEFAULT_LABEL_HANDLERS,
            block_decoders: DEFAULT_BLOCK_DECODERS,
            meta_cache_size: DEFAULT_META_CACHE_SIZE,
            handler_tokens: DEFAULT_HANDLER_TOKENS,
            block_change_buffer: DEFAULT_BLOCK_CHANGE_BUFFER,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set block dimensions
    pub fn block_size(mut self, size: Point3d) -> Self {
        self.block_size = size;
        self
    }

    /// Set the number of label index shards
    pub fn num_label_handlers(mut self, n: usize) -> Self {
        self.num_label_handlers = n.max(1);
        self
    }

    /// Set the decode worker pool size
    pub fn block_decoders(mut self, n: usize) -> Self {
        self.block_decoders = n.max(1);
        self
    }

    /// Set the per-shard Meta cache capacity
    pub fn meta_cache_size(mut self, n: usize) -> Self {
        self.meta_cache_size = n.max(MIN_META_CACHE_SIZE);
        self
    }

    /// Set the chunk-task semaphore size
    pub fn handler_tokens(mut self, n: usize) -> Self {
        self.handler_tokens = n.max(1);
        self
    }

    /// Set the block-change channel capacity
    pub fn block_change_buffer(mut self, n: usize) -> Self {
        self.block_change_buffer = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.block_size, Point3d([64, 64, 64]));
        assert_eq!(config.num_label_handlers, 32);
        assert_eq!(config.block_decoders, 10);
        assert_eq!(config.meta_cache_size, 100);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .block_size(Point3d([32, 32, 32]))
            .num_label_handlers(4)
            .meta_cache_size(10)
            .handler_tokens(2);

        assert_eq!(config.block_size, Point3d([32, 32, 32]));
        assert_eq!(config.num_label_handlers, 4);
        // below the floor, raised to the minimum
        assert_eq!(config.meta_cache_size, 50);
        assert_eq!(config.handler_tokens, 2);
    }
}
