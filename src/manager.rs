use std::sync::Arc;

use tokio::{runtime::Handle, sync::broadcast};
use tracing::info;

use crate::{
    cache::Cache,
    config::ManagerOptions,
    error::{CacheResult, VolumeError, VolumeResult},
    events::{CacheEvent, EventBus},
    pool::RequestPool,
    registry::{LoaderContext, VolumeLoadOptions, VolumeLoaderFn, VolumeLoaderRegistry},
    scheduler::{FrameLoadScheduler, LoadRequest, ProgressCallback},
    volume::{VolumeDescriptor, VolumeObserver},
};

/// Application context owning the cache, the request pool, the scheduler and
/// the loader registry.
pub struct VolumeManager {
    context: LoaderContext,
    registry: VolumeLoaderRegistry,
}

impl VolumeManager {
    /// Manager driven by the tokio runtime the caller is running in.
    pub fn new(options: ManagerOptions) -> VolumeResult<Self> {
        let handle = Handle::try_current().map_err(|_| VolumeError::NoRuntime)?;
        Ok(Self::with_handle(handle, options))
    }

    pub fn with_handle(handle: Handle, options: ManagerOptions) -> Self {
        let events = EventBus::new(options.event_capacity);
        let cache = Cache::with_events(options.cache, events);
        let pool = RequestPool::new(handle, &options.pool);
        Self {
            context: LoaderContext {
                cache,
                scheduler: FrameLoadScheduler::new(pool),
                observer: None,
            },
            registry: VolumeLoaderRegistry::new(),
        }
    }

    /// Observer handed to every volume created from now on.
    pub fn with_observer(mut self, observer: Arc<dyn VolumeObserver>) -> Self {
        self.context.observer = Some(observer);
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.context.cache
    }

    pub fn scheduler(&self) -> &FrameLoadScheduler {
        &self.context.scheduler
    }

    pub fn pool(&self) -> &RequestPool {
        self.context.scheduler.pool()
    }

    pub fn registry(&self) -> &VolumeLoaderRegistry {
        &self.registry
    }

    pub fn context(&self) -> &LoaderContext {
        &self.context
    }

    pub fn register_volume_loader(&self, scheme: impl Into<String>, loader: VolumeLoaderFn) {
        self.registry.register(scheme, loader);
    }

    pub fn register_unknown_volume_loader(&self, loader: VolumeLoaderFn) {
        self.registry.register_unknown(loader);
    }

    /// Return the cached volume or create it through its scheme's loader.
    pub fn create_volume(
        &self,
        volume_id: &str,
        options: VolumeLoadOptions,
    ) -> VolumeResult<Arc<VolumeDescriptor>> {
        self.registry.create(volume_id, options, &self.context)
    }

    pub fn get_volume(&self, volume_id: &str) -> Option<Arc<VolumeDescriptor>> {
        self.context.cache.get_volume(volume_id)
    }

    fn require_volume(&self, volume_id: &str) -> VolumeResult<Arc<VolumeDescriptor>> {
        self.get_volume(volume_id)
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))
    }

    pub fn load(&self, volume_id: &str, callback: ProgressCallback) -> VolumeResult<()> {
        let volume = self.require_volume(volume_id)?;
        self.context.scheduler.load(&volume, callback)
    }

    pub fn load_with(
        &self,
        volume_id: &str,
        request: &LoadRequest,
        callback: ProgressCallback,
    ) -> VolumeResult<()> {
        let volume = self.require_volume(volume_id)?;
        self.context.scheduler.load_with(&volume, request, callback)
    }

    pub fn cancel_load(&self, volume_id: &str) -> VolumeResult<()> {
        let volume = self.require_volume(volume_id)?;
        self.context.scheduler.cancel(&volume);
        Ok(())
    }

    /// Drop the volume from the cache, freeing its buffer.
    pub fn decache_volume(&self, volume_id: &str) -> VolumeResult<()> {
        match self.context.cache.remove(volume_id) {
            Ok(_) => Ok(()),
            Err(_) => Err(VolumeError::VolumeNotFound(volume_id.to_string())),
        }
    }

    pub fn set_max_cache_size(&self, max_bytes: u64) -> CacheResult<()> {
        self.context.cache.set_max_size(max_bytes)
    }

    pub fn get_cache_size(&self) -> u64 {
        self.context.cache.current_size()
    }

    pub fn get_max_cache_size(&self) -> u64 {
        self.context.cache.max_size()
    }

    pub fn purge_cache(&self) {
        info!("purging volume cache");
        self.context.cache.purge();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.context.cache.subscribe()
    }
}
