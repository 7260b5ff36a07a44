//! Scheme-keyed volume loaders.
//!
//! A volume id has the form `scheme:rest`. The registry maps the scheme to a
//! constructor that resolves geometry, creates the [`VolumeDescriptor`] and
//! optionally starts loading it. Registering a scheme again replaces the
//! previous constructor.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    cache::Cache,
    error::{VolumeError, VolumeResult},
    scheduler::{
        FrameFetcher, FrameLoadScheduler, FrameSource, LoadRequest, LoadStatusEvent,
        ProgressCallback, progress_callback,
    },
    volume::{MetadataProvider, VolumeDescriptor, VolumeGeometry, VolumeObserver},
};

/// Everything a loader needs to build and start a volume.
#[derive(Clone)]
pub struct LoaderContext {
    pub cache: Cache,
    pub scheduler: FrameLoadScheduler,
    pub observer: Option<Arc<dyn VolumeObserver>>,
}

#[derive(Clone, Default)]
pub struct VolumeLoadOptions {
    /// One source reference per frame, in frame order.
    pub source_refs: Vec<String>,
    /// Skips the metadata provider when set.
    pub geometry: Option<VolumeGeometry>,
    pub start_loading: bool,
    pub request: LoadRequest,
    pub callback: Option<ProgressCallback>,
}

impl VolumeLoadOptions {
    pub fn new(source_refs: Vec<String>) -> Self {
        Self {
            source_refs,
            ..Self::default()
        }
    }

    pub fn with_geometry(mut self, geometry: VolumeGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Start loading right after creation, reporting to `callback`.
    pub fn start_loading(mut self, callback: ProgressCallback) -> Self {
        self.start_loading = true;
        self.callback = Some(callback);
        self
    }

    pub fn with_request(mut self, request: LoadRequest) -> Self {
        self.request = request;
        self
    }
}

impl fmt::Debug for VolumeLoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeLoadOptions")
            .field("source_refs", &self.source_refs.len())
            .field("geometry", &self.geometry)
            .field("start_loading", &self.start_loading)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

pub type VolumeLoaderFn = Arc<
    dyn Fn(&str, VolumeLoadOptions, &LoaderContext) -> VolumeResult<Arc<VolumeDescriptor>>
        + Send
        + Sync,
>;

/// The scheme of `volume_id`, i.e. everything before the first `:`.
pub fn scheme_of(volume_id: &str) -> Option<&str> {
    volume_id.split_once(':').map(|(scheme, _)| scheme)
}

#[derive(Default)]
pub struct VolumeLoaderRegistry {
    loaders: RwLock<HashMap<String, VolumeLoaderFn>>,
    unknown: RwLock<Option<VolumeLoaderFn>>,
}

impl VolumeLoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheme: impl Into<String>, loader: VolumeLoaderFn) {
        let scheme = scheme.into();
        if self.loaders.write().insert(scheme.clone(), loader).is_some() {
            info!(%scheme, "volume loader replaced");
        } else {
            debug!(%scheme, "volume loader registered");
        }
    }

    /// Fallback for ids whose scheme has no loader.
    pub fn register_unknown(&self, loader: VolumeLoaderFn) {
        *self.unknown.write() = Some(loader);
    }

    pub fn resolve(&self, volume_id: &str) -> VolumeResult<VolumeLoaderFn> {
        let registered = scheme_of(volume_id)
            .and_then(|scheme| self.loaders.read().get(scheme).cloned());
        registered
            .or_else(|| self.unknown.read().clone())
            .ok_or_else(|| VolumeError::UnknownScheme(volume_id.to_string()))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.loaders.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Return the cached volume for `volume_id`, or build it with the
    /// loader registered for its scheme.
    pub fn create(
        &self,
        volume_id: &str,
        options: VolumeLoadOptions,
        context: &LoaderContext,
    ) -> VolumeResult<Arc<VolumeDescriptor>> {
        if let Some(volume) = context.cache.get_volume(volume_id) {
            debug!(volume_id, "volume served from cache");
            return Ok(volume);
        }
        let loader = self.resolve(volume_id)?;
        loader(volume_id, options, context)
    }
}

/// Create a volume whose frames come from `fetcher`, and start loading it if
/// the options ask for it.
pub fn create_streaming_volume(
    volume_id: &str,
    geometry: VolumeGeometry,
    options: VolumeLoadOptions,
    fetcher: Arc<dyn FrameFetcher>,
    context: &LoaderContext,
) -> VolumeResult<Arc<VolumeDescriptor>> {
    let VolumeLoadOptions {
        source_refs,
        start_loading,
        request,
        callback,
        ..
    } = options;

    let volume = VolumeDescriptor::create(
        &context.cache,
        volume_id,
        geometry,
        Some(FrameSource::new(source_refs, fetcher)),
        context.observer.clone(),
    )?;

    if start_loading {
        let callback = callback.unwrap_or_else(|| progress_callback(|_: &LoadStatusEvent| {}));
        context.scheduler.load_with(&volume, &request, callback)?;
    }
    Ok(volume)
}

/// Loader that asks `provider` for geometry and streams frames through
/// `fetcher`.
pub fn streaming_loader(
    provider: Arc<dyn MetadataProvider>,
    fetcher: Arc<dyn FrameFetcher>,
) -> VolumeLoaderFn {
    Arc::new(
        move |volume_id: &str, options: VolumeLoadOptions, context: &LoaderContext| {
            let geometry = match &options.geometry {
                Some(geometry) => geometry.clone(),
                None => provider.geometry(&options.source_refs)?,
            };
            create_streaming_volume(volume_id, geometry, options, Arc::clone(&fetcher), context)
        },
    )
}
