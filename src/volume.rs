use std::{fmt, mem, sync::Arc};

use bytemuck::Pod;
use image::{GrayImage, ImageBuffer};
use ndarray::{Array3, ArrayView2, s};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use web_time::SystemTime;

use crate::{
    cache::{Cache, CachePayload},
    enums::{Orientation, ScalarType},
    error::{CacheError, FrameError, VolumeError, VolumeResult},
    frame_buffer::FrameBuffer,
    scheduler::{FrameSource, LoadStatusEvent, ProgressCallback},
};

const IDENTITY_DIRECTION: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Geometry of a 3D grid. One frame is one XY plane; `dims.2` is the frame
/// count.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeGeometry {
    pub dims: (usize, usize, usize),
    pub spacing: (f64, f64, f64),
    pub origin: (f64, f64, f64),
    /// Row-major direction cosines: row, column and slice axes.
    pub direction: [f64; 9],
    pub scalar_type: ScalarType,
}

impl VolumeGeometry {
    pub fn new(dims: (usize, usize, usize), scalar_type: ScalarType) -> Self {
        Self {
            dims,
            spacing: (1.0, 1.0, 1.0),
            origin: (0.0, 0.0, 0.0),
            direction: IDENTITY_DIRECTION,
            scalar_type,
        }
    }

    pub fn with_spacing(mut self, spacing: (f64, f64, f64)) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_origin(mut self, origin: (f64, f64, f64)) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_direction(mut self, direction: [f64; 9]) -> Self {
        self.direction = direction;
        self
    }

    pub fn frame_count(&self) -> usize {
        self.dims.2
    }

    /// Bytes in one XY plane.
    pub fn frame_len(&self) -> usize {
        self.dims.0 * self.dims.1 * self.scalar_type.bytes_per_voxel()
    }

    pub fn size_bytes(&self) -> u64 {
        self.frame_len() as u64 * self.frame_count() as u64
    }

    pub fn validate(&self) -> VolumeResult<()> {
        let (nx, ny, nz) = self.dims;
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(VolumeError::InvalidGeometry(format!(
                "dimensions must be non-zero, got {nx}x{ny}x{nz}"
            )));
        }
        nx.checked_mul(ny)
            .and_then(|n| n.checked_mul(nz))
            .and_then(|n| n.checked_mul(self.scalar_type.bytes_per_voxel()))
            .ok_or_else(|| {
                VolumeError::InvalidGeometry(format!("{nx}x{ny}x{nz} overflows the address space"))
            })?;
        let (sx, sy, sz) = self.spacing;
        if [sx, sy, sz].iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(VolumeError::InvalidGeometry(format!(
                "spacing must be positive, got {sx}, {sy}, {sz}"
            )));
        }
        Ok(())
    }
}

/// Supplies geometry for a list of source identifiers.
pub trait MetadataProvider: Send + Sync {
    fn geometry(&self, source_refs: &[String]) -> VolumeResult<VolumeGeometry>;
}

/// Render-side capability notified about buffer changes. Implementations
/// must not call back into the cache.
pub trait VolumeObserver: Send + Sync {
    fn frame_updated(&self, volume_id: &str, frame_index: usize);

    fn buffer_reallocated(&self, _volume_id: &str) {}

    fn volume_released(&self, _volume_id: &str) {}
}

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    frames_loaded: usize,
    frames_processed: usize,
}

struct LoadState {
    frame_loaded: Vec<bool>,
    loading: bool,
    loaded: bool,
    released: bool,
    pending_callbacks: Vec<ProgressCallback>,
    run: Option<ActiveRun>,
    next_run_id: u64,
}

impl LoadState {
    fn loaded_count(&self) -> usize {
        self.frame_loaded.iter().filter(|loaded| **loaded).count()
    }
}

/// Outcome of [`VolumeDescriptor::begin_run`].
pub(crate) enum RunStart {
    /// Everything is loaded; the caller gets this terminal event directly.
    AlreadyLoaded(LoadStatusEvent),
    /// A run is in progress; the callback was added to it.
    Joined,
    Started {
        run_id: u64,
        cancel: CancellationToken,
        unloaded: Vec<usize>,
    },
}

pub(crate) enum Commit {
    Written { newly_loaded: bool },
    /// The run was cancelled or the volume released; nothing was written.
    Discarded,
}

/// Progress callbacks and the events to deliver to them, in order.
pub(crate) struct Emission {
    pub(crate) callbacks: Vec<ProgressCallback>,
    pub(crate) events: Vec<LoadStatusEvent>,
}

impl Emission {
    pub(crate) fn deliver(self) {
        for event in &self.events {
            for callback in &self.callbacks {
                callback(event);
            }
        }
    }
}

/// A 3D scalar grid registered in the cache, together with its per-frame
/// load state.
///
/// The buffer sits behind a gate: frame commits hold it shared, `cancel` and
/// `release` hold it exclusively. Once either returns, no in-flight frame
/// can write into the buffer anymore.
pub struct VolumeDescriptor {
    id: String,
    geometry: VolumeGeometry,
    created_at: SystemTime,
    source: Option<FrameSource>,
    observer: Option<Arc<dyn VolumeObserver>>,
    buffer: RwLock<Option<FrameBuffer>>,
    state: Mutex<LoadState>,
}

impl VolumeDescriptor {
    /// Admit the volume into `cache`, allocate its zeroed buffer and register
    /// it as a volume entry.
    ///
    /// Nothing is allocated if admission fails.
    pub fn create(
        cache: &Cache,
        id: impl Into<String>,
        geometry: VolumeGeometry,
        source: Option<FrameSource>,
        observer: Option<Arc<dyn VolumeObserver>>,
    ) -> VolumeResult<Arc<Self>> {
        let id = id.into();
        geometry.validate()?;
        if let Some(source) = &source {
            if source.refs.len() != geometry.frame_count() {
                return Err(VolumeError::InvalidGeometry(format!(
                    "{} source references for {} frames",
                    source.refs.len(),
                    geometry.frame_count()
                )));
            }
        }

        let admission = cache
            .admit(id.clone(), geometry.size_bytes())
            .map_err(|err| match err {
                CacheError::DuplicateKey(key) => VolumeError::DuplicateVolumeId(key),
                other => VolumeError::Cache(other),
            })?;

        let frame_count = geometry.frame_count();
        let volume = Arc::new(Self {
            buffer: RwLock::new(Some(FrameBuffer::zeroed(geometry.frame_len(), frame_count))),
            state: Mutex::new(LoadState {
                frame_loaded: vec![false; frame_count],
                loading: false,
                loaded: false,
                released: false,
                pending_callbacks: Vec::new(),
                run: None,
                next_run_id: 0,
            }),
            id,
            geometry,
            created_at: SystemTime::now(),
            source,
            observer,
        });

        admission.commit(CachePayload::Volume(Arc::clone(&volume)))?;

        info!(
            volume_id = %volume.id,
            dims = ?volume.geometry.dims,
            size_bytes = volume.size_bytes(),
            "volume created"
        );
        if let Some(observer) = &volume.observer {
            observer.buffer_reallocated(&volume.id);
        }
        Ok(volume)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Dimensions (nx, ny, nz).
    pub fn dims(&self) -> (usize, usize, usize) {
        self.geometry.dims
    }

    pub fn spacing(&self) -> (f64, f64, f64) {
        self.geometry.spacing
    }

    pub fn origin(&self) -> (f64, f64, f64) {
        self.geometry.origin
    }

    pub fn direction(&self) -> [f64; 9] {
        self.geometry.direction
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.geometry.scalar_type
    }

    pub fn frame_count(&self) -> usize {
        self.geometry.frame_count()
    }

    pub fn frame_len(&self) -> usize {
        self.geometry.frame_len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.geometry.size_bytes()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn source(&self) -> Option<&FrameSource> {
        self.source.as_ref()
    }

    pub fn observer(&self) -> Option<&Arc<dyn VolumeObserver>> {
        self.observer.as_ref()
    }

    /// Copy one frame into the buffer and mark it loaded.
    ///
    /// Returns whether the frame was newly loaded; rewriting a loaded frame
    /// replaces its bytes but is not counted again.
    pub fn write_frame(&self, frame_index: usize, bytes: &[u8]) -> VolumeResult<bool> {
        let gate = self.buffer.read();
        let buffer = gate
            .as_ref()
            .ok_or_else(|| VolumeError::Released(self.id.clone()))?;
        buffer.write(frame_index, bytes)?;
        Ok(self.mark_loaded(frame_index))
    }

    fn mark_loaded(&self, frame_index: usize) -> bool {
        let mut state = self.state.lock();
        let newly_loaded = !mem::replace(&mut state.frame_loaded[frame_index], true);
        state.loaded = state.frame_loaded.iter().all(|loaded| *loaded);
        newly_loaded
    }

    /// Write a frame produced by load run `run_id`, unless that run is no
    /// longer current.
    pub(crate) fn commit_frame(
        &self,
        run_id: u64,
        frame_index: usize,
        bytes: &[u8],
    ) -> Result<Commit, FrameError> {
        let gate = self.buffer.read();
        let Some(buffer) = gate.as_ref() else {
            return Ok(Commit::Discarded);
        };
        {
            let state = self.state.lock();
            match &state.run {
                Some(run) if run.id == run_id && !run.cancel.is_cancelled() => {}
                _ => {
                    trace!(volume_id = %self.id, frame_index, "discarding stale frame");
                    return Ok(Commit::Discarded);
                }
            }
        }

        match buffer.write(frame_index, bytes) {
            Ok(()) => Ok(Commit::Written {
                newly_loaded: self.mark_loaded(frame_index),
            }),
            Err(VolumeError::InvalidFrameLength {
                expected, actual, ..
            }) => Err(FrameError::InvalidLength { expected, actual }),
            Err(err) => Err(FrameError::Decode(err.to_string())),
        }
    }

    /// Start a load run, join the active one, or report that everything is
    /// already loaded.
    pub(crate) fn begin_run(&self, callback: ProgressCallback) -> VolumeResult<RunStart> {
        let mut state = self.state.lock();
        if state.released {
            return Err(VolumeError::Released(self.id.clone()));
        }
        if state.loaded {
            let frame_count = self.frame_count();
            return Ok(RunStart::AlreadyLoaded(LoadStatusEvent {
                volume_id: self.id.clone(),
                success: true,
                frame_index: None,
                frames_loaded: frame_count,
                frames_processed: frame_count,
                frame_count,
                error: None,
                terminal: true,
            }));
        }
        state.pending_callbacks.push(callback);
        if state.loading {
            return Ok(RunStart::Joined);
        }

        let run_id = state.next_run_id;
        state.next_run_id += 1;
        let skipped = state.loaded_count();
        let unloaded = state
            .frame_loaded
            .iter()
            .enumerate()
            .filter(|(_, loaded)| !**loaded)
            .map(|(index, _)| index)
            .collect();
        let cancel = CancellationToken::new();
        state.loading = true;
        state.run = Some(ActiveRun {
            id: run_id,
            cancel: cancel.clone(),
            frames_loaded: skipped,
            frames_processed: skipped,
        });

        debug!(volume_id = %self.id, run_id, skipped, "load run started");
        Ok(RunStart::Started {
            run_id,
            cancel,
            unloaded,
        })
    }

    /// Account one processed frame of run `run_id`. Returns the events to
    /// deliver, including the terminal event once every frame is processed.
    pub(crate) fn record_outcome(
        &self,
        run_id: u64,
        frame_index: usize,
        outcome: Result<bool, FrameError>,
    ) -> Option<Emission> {
        let frame_count = self.frame_count();
        let mut state = self.state.lock();
        let run = state.run.as_mut().filter(|run| run.id == run_id)?;

        let success = outcome.is_ok();
        if matches!(outcome, Ok(true)) {
            run.frames_loaded += 1;
        }
        run.frames_processed += 1;

        let frames_loaded = run.frames_loaded;
        let frames_processed = run.frames_processed;
        let mut events = vec![LoadStatusEvent {
            volume_id: self.id.clone(),
            success,
            frame_index: Some(frame_index),
            frames_loaded,
            frames_processed,
            frame_count,
            error: outcome.err(),
            terminal: false,
        }];

        if frames_processed < frame_count {
            return Some(Emission {
                callbacks: state.pending_callbacks.clone(),
                events,
            });
        }

        state.run = None;
        state.loading = false;
        state.loaded = state.frame_loaded.iter().all(|loaded| *loaded);
        events.push(LoadStatusEvent {
            volume_id: self.id.clone(),
            success: state.loaded,
            frame_index: None,
            frames_loaded,
            frames_processed,
            frame_count,
            error: None,
            terminal: true,
        });
        info!(volume_id = %self.id, frames_loaded, frame_count, "load run finished");

        Some(Emission {
            callbacks: mem::take(&mut state.pending_callbacks),
            events,
        })
    }

    /// Stop the active load run. Frames already written stay in place.
    pub fn cancel(&self) {
        let _gate = self.buffer.write();
        let mut state = self.state.lock();
        if let Some(run) = state.run.take() {
            run.cancel.cancel();
            debug!(volume_id = %self.id, run_id = run.id, "load run cancelled");
        }
        state.loading = false;
        state.pending_callbacks.clear();
    }

    /// Free the buffer and stop any load. Called when the cache drops the
    /// volume.
    pub fn release(&self) {
        let freed = {
            let mut gate = self.buffer.write();
            let mut state = self.state.lock();
            if let Some(run) = state.run.take() {
                run.cancel.cancel();
            }
            state.loading = false;
            state.loaded = false;
            state.released = true;
            state.pending_callbacks.clear();
            state.frame_loaded.iter_mut().for_each(|loaded| *loaded = false);
            gate.take().is_some()
        };

        if freed {
            info!(volume_id = %self.id, "volume released");
            if let Some(observer) = &self.observer {
                observer.volume_released(&self.id);
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().frame_loaded.iter().all(|loaded| *loaded)
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    pub fn frame_loaded(&self, frame_index: usize) -> bool {
        self.state
            .lock()
            .frame_loaded
            .get(frame_index)
            .copied()
            .unwrap_or(false)
    }

    pub fn frame_loaded_mask(&self) -> Vec<bool> {
        self.state.lock().frame_loaded.clone()
    }

    pub fn frames_loaded(&self) -> usize {
        self.state.lock().loaded_count()
    }

    /// Fraction of frames loaded, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        self.frames_loaded() as f64 / self.frame_count() as f64
    }

    pub fn pending_callback_count(&self) -> usize {
        self.state.lock().pending_callbacks.len()
    }

    pub fn with_frame<R>(&self, frame_index: usize, f: impl FnOnce(&[u8]) -> R) -> VolumeResult<R> {
        let gate = self.buffer.read();
        gate.as_ref()
            .ok_or_else(|| VolumeError::Released(self.id.clone()))?
            .with_frame(frame_index, f)
    }

    /// Contiguous copy of the whole buffer, frame after frame.
    pub fn snapshot(&self) -> VolumeResult<Vec<u8>> {
        let gate = self.buffer.read();
        let buffer = gate
            .as_ref()
            .ok_or_else(|| VolumeError::Released(self.id.clone()))?;
        Ok(buffer.to_vec())
    }

    /// Typed copy of the buffer in (z, y, x) order. `T` must match the
    /// volume's scalar width.
    pub fn to_array<T: Pod>(&self) -> VolumeResult<Array3<T>> {
        let width = self.scalar_type().bytes_per_voxel();
        if mem::size_of::<T>() != width {
            return Err(VolumeError::InvalidGeometry(format!(
                "requested {}-byte scalars from a {width}-byte volume",
                mem::size_of::<T>()
            )));
        }
        let bytes = self.snapshot()?;
        let values: Vec<T> = bytemuck::pod_collect_to_vec(&bytes);
        let (nx, ny, nz) = self.dims();
        Array3::from_shape_vec((nz, ny, nx), values)
            .map_err(|err| VolumeError::InvalidGeometry(err.to_string()))
    }

    fn to_f32_array(&self) -> VolumeResult<Array3<f32>> {
        Ok(match self.scalar_type() {
            ScalarType::U8 => self.to_array::<u8>()?.mapv(f32::from),
            ScalarType::U16 => self.to_array::<u16>()?.mapv(f32::from),
            ScalarType::F32 => self.to_array::<f32>()?,
        })
    }

    /// Grayscale preview of one slice, normalized to the slice's value range.
    /// Unloaded frames show as zeros.
    pub fn slice_image(&self, index: usize, orientation: Orientation) -> VolumeResult<GrayImage> {
        let (nx, ny, nz) = self.dims();
        let limit = match orientation {
            Orientation::Axial => nz,
            Orientation::Coronal => ny,
            Orientation::Sagittal => nx,
        };
        if index >= limit {
            return Err(VolumeError::FrameOutOfRange {
                frame_index: index,
                frame_count: limit,
            });
        }

        let data = self.to_f32_array()?;
        let slice = match orientation {
            Orientation::Axial => data.slice(s![index, .., ..]),
            Orientation::Coronal => data.slice(s![.., index, ..]),
            Orientation::Sagittal => data.slice(s![.., .., index]),
        };
        Self::slice_to_image(&slice).ok_or_else(|| {
            VolumeError::InvalidGeometry("slice does not fit an image buffer".to_string())
        })
    }

    fn slice_to_image(slice: &ArrayView2<'_, f32>) -> Option<GrayImage> {
        let (height, width) = slice.dim();
        let (min, max) = slice
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = if max > min { max - min } else { 1.0 };
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| (((v - min) / range) * 255.0).clamp(0.0, 255.0) as u8)
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }
}

impl fmt::Debug for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VolumeDescriptor")
            .field("id", &self.id)
            .field("dims", &self.geometry.dims)
            .field("scalar_type", &self.geometry.scalar_type)
            .field("frames_loaded", &state.loaded_count())
            .field("loading", &state.loading)
            .field("loaded", &state.loaded)
            .finish()
    }
}
