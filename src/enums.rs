use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// Scalar type of a voxel in a volume buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    #[default]
    U16,
    F32,
}

impl ScalarType {
    pub fn bytes_per_voxel(self) -> usize {
        match self {
            ScalarType::U8 => 1,
            ScalarType::U16 => 2,
            ScalarType::F32 => 4,
        }
    }

    /// Map a DICOM "bits allocated" value to the scalar type used to hold it.
    pub fn from_bits_allocated(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(ScalarType::U8),
            16 => Some(ScalarType::U16),
            32 => Some(ScalarType::F32),
            _ => None,
        }
    }
}

/// Category a fetch request is pooled under. Each category has its own
/// concurrency limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    Interaction,
    Thumbnail,
    Prefetch,
    Compute,
}

impl RequestType {
    pub const ALL: [RequestType; 4] = [
        RequestType::Interaction,
        RequestType::Thumbnail,
        RequestType::Prefetch,
        RequestType::Compute,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            RequestType::Interaction => 0,
            RequestType::Thumbnail => 1,
            RequestType::Prefetch => 2,
            RequestType::Compute => 3,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Interaction => "interaction",
            RequestType::Thumbnail => "thumbnail",
            RequestType::Prefetch => "prefetch",
            RequestType::Compute => "compute",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Image,
    Volume,
}
