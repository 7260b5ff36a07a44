//! # DICOM-volume-stream library
//!
//! This crate keeps multi-frame imaging volumes in a byte-budgeted cache and
//! fills them progressively, one frame at a time, as the frames are fetched
//! and decoded.
//!
//! A volume is a 3D scalar grid whose buffer is allocated up front and
//! zeroed. Frames (XY planes) arrive in any order and land in their own slot
//! of the buffer, so a viewer can render a partially loaded volume while the
//! rest is still streaming in. Frame requests go through a bounded request
//! pool with one lane per request type:
//!  - Interaction
//!  - Thumbnail
//!  - Prefetch
//!  - Compute
//!
//! Volume ids have the form `scheme:rest`; loaders are registered per scheme.
//! The `dicomdir:` scheme reads every ".dcm" file of a directory, sorts the
//! slices and decodes each one on a blocking thread when it is scheduled.
//! DICOM files are assumed to have the following attributes:
//!   - No multiframe (always the first frame is used)
//!   - Images from the same series and acquisition
//!
//! # Examples
//!
//! ## Streaming a DICOM directory into the cache
//!
//! Create the volume, wait for the terminal progress event, then take the
//! axial slice at the centre of the volume.
//!
//! ```no_run
//! # use dicom_volume_stream::{
//! #     dicom_source::register_dicom_loaders, EventRecorder, ManagerOptions, Orientation,
//! #     SortBy, VolumeLoadOptions, VolumeManager,
//! # };
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = VolumeManager::new(ManagerOptions::default())?;
//! register_dicom_loaders(manager.registry(), SortBy::InstanceNumber);
//!
//! let progress = EventRecorder::new();
//! let volume = manager.create_volume(
//!     "dicomdir:dicom",
//!     VolumeLoadOptions::default().start_loading(progress.callback()),
//! )?;
//! progress.wait_terminal().await;
//!
//! let image = volume.slice_image(volume.dims().2 / 2, Orientation::Axial)?;
//! image.save("result.png")?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod dicom_source;
pub mod enums;
pub mod error;
pub mod events;
pub mod frame_buffer;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod testing;
pub mod volume;

pub use cache::{Admission, Cache, CacheEntry, CachePayload, CachedImage};
pub use config::{CacheOptions, ManagerOptions, PoolOptions};
pub use enums::{EntryKind, Orientation, RequestType, ScalarType, SortBy};
pub use error::{CacheError, CacheResult, FrameError, VolumeError, VolumeResult};
pub use events::{CacheEvent, EventBus};
pub use manager::VolumeManager;
pub use pool::RequestPool;
pub use registry::{
    LoaderContext, VolumeLoadOptions, VolumeLoaderFn, VolumeLoaderRegistry,
    create_streaming_volume, streaming_loader,
};
pub use scheduler::{
    FrameFetcher, FrameLoadScheduler, FrameOrder, FrameSource, FrameTask, LoadRequest,
    LoadStatusEvent, ProgressCallback, progress_callback,
};
pub use testing::EventRecorder;
pub use volume::{MetadataProvider, VolumeDescriptor, VolumeGeometry, VolumeObserver};
