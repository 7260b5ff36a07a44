//! Options for the cache, the request pool and the manager tying them together.

use crate::enums::RequestType;

const ONE_GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Byte budget shared by every cached image and volume.
    pub max_bytes: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: 3 * ONE_GIB,
        }
    }
}

impl CacheOptions {
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// Concurrency limits of the request pool, one per [`RequestType`].
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub interaction: usize,
    pub thumbnail: usize,
    pub prefetch: usize,
    pub compute: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            interaction: 6,
            thumbnail: 6,
            prefetch: 5,
            compute: rayon::current_num_threads(),
        }
    }
}

impl PoolOptions {
    pub fn max_concurrency(&self, request_type: RequestType) -> usize {
        match request_type {
            RequestType::Interaction => self.interaction,
            RequestType::Thumbnail => self.thumbnail,
            RequestType::Prefetch => self.prefetch,
            RequestType::Compute => self.compute,
        }
    }

    pub fn with_max_concurrency(mut self, request_type: RequestType, max: usize) -> Self {
        let slot = match request_type {
            RequestType::Interaction => &mut self.interaction,
            RequestType::Thumbnail => &mut self.thumbnail,
            RequestType::Prefetch => &mut self.prefetch,
            RequestType::Compute => &mut self.compute,
        };
        *slot = max;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ManagerOptions {
    pub cache: CacheOptions,
    pub pool: PoolOptions,
    /// Capacity of the cache event channel. Lagging subscribers lose events.
    pub event_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            pool: PoolOptions::default(),
            event_capacity: 64,
        }
    }
}

impl ManagerOptions {
    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
