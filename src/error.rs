use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(
        "Cache size exceeded: {requested} bytes requested, {available} of {max_size} bytes available"
    )]
    CacheSizeExceeded {
        requested: u64,
        available: u64,
        max_size: u64,
    },

    #[error("Max cache size {requested} is below the {current} bytes in use")]
    MaxSizeBelowUsage { requested: u64, current: u64 },

    #[error("Cache key already in use: {0}")]
    DuplicateKey(String),

    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Admission for {key} was for {admitted} bytes, payload has {actual}")]
    AdmissionMismatch {
        key: String,
        admitted: u64,
        actual: u64,
    },
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Frame {frame_index} must be {expected} bytes, got {actual}")]
    InvalidFrameLength {
        frame_index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Frame index {frame_index} out of range for {frame_count} frames")]
    FrameOutOfRange {
        frame_index: usize,
        frame_count: usize,
    },

    #[error("Volume id already in use: {0}")]
    DuplicateVolumeId(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume {0} has been released")]
    Released(String),

    #[error("Volume {0} has no frame source to load from")]
    NoFrameSource(String),

    #[error("No volume loader registered for scheme of {0}")]
    UnknownScheme(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("No tokio runtime available to drive frame loading")]
    NoRuntime,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Failure of a single frame. Reported through the progress callbacks, never
/// returned from a load call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Frame deadline expired")]
    DeadlineExpired,

    #[error("Decoded frame has {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },
}

pub type CacheResult<T> = Result<T, CacheError>;
pub type VolumeResult<T> = Result<T, VolumeError>;
