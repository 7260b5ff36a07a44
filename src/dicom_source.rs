//! DICOM series as a frame source.
//!
//! Geometry is derived from the headers of the series (read up to, but not
//! including, the pixel data) and every frame is decoded on a blocking thread
//! when the scheduler asks for it. One file is one frame; multi-frame objects
//! contribute their first frame only.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, OpenFileOptions, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use futures::{FutureExt, future::BoxFuture};
use ndarray::s;
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    enums::{ScalarType, SortBy},
    error::{FrameError, VolumeError, VolumeResult},
    registry::{
        LoaderContext, VolumeLoadOptions, VolumeLoaderFn, VolumeLoaderRegistry,
        create_streaming_volume, streaming_loader,
    },
    scheduler::{FrameFetcher, FrameTask},
    volume::{MetadataProvider, VolumeGeometry},
};

/// `dicomdir:<directory>`: every `.dcm` file of the directory, sorted.
pub const DICOM_DIR_SCHEME: &str = "dicomdir";
/// `dicomfiles:<name>`: files given as source references, already in order.
pub const DICOM_FILES_SCHEME: &str = "dicomfiles";

#[derive(Clone, Debug, PartialEq)]
struct SliceHeader {
    path: PathBuf,
    order: Option<f32>,
    rows: usize,
    columns: usize,
    position: Option<[f64; 3]>,
    orientation: Option<[f64; 6]>,
    pixel_spacing: Option<(f64, f64)>,
    slice_thickness: Option<f64>,
}

/// Headers of a DICOM series in frame order.
#[derive(Debug)]
pub struct DicomSeries {
    headers: Vec<SliceHeader>,
}

impl DicomSeries {
    /// Read the headers of every `.dcm` file in `path`.
    pub fn from_directory(path: impl AsRef<Path>, sort_by: SortBy) -> VolumeResult<Self> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeError::NoValidImages);
        }

        Self::from_file_paths(paths.as_slice(), sort_by)
    }

    pub fn from_file_paths(paths: &[impl AsRef<Path> + Sync], sort_by: SortBy) -> VolumeResult<Self> {
        let headers: Vec<Option<SliceHeader>> = paths
            .par_iter()
            .map(|path| Self::read_header(path.as_ref(), &sort_by))
            .collect::<VolumeResult<_>>()?;
        let mut headers: Vec<SliceHeader> = headers.into_iter().flatten().collect();

        if headers.is_empty() {
            return Err(VolumeError::NoValidImages);
        }
        Self::sort_headers(&mut headers, sort_by);
        debug!(slices = headers.len(), "read DICOM series headers");

        Ok(Self { headers })
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// File paths in frame order.
    pub fn source_refs(&self) -> Vec<String> {
        self.headers
            .iter()
            .map(|header| header.path.to_string_lossy().into_owned())
            .collect()
    }

    pub fn geometry(&self) -> VolumeResult<VolumeGeometry> {
        geometry_from_headers(&self.headers)
    }

    fn read_header(path: &Path, sort_by: &SortBy) -> VolumeResult<Option<SliceHeader>> {
        let object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)?;

        let Some(order) = Self::get_sort_order(&object, sort_by) else {
            warn!(path = %path.display(), "skipping file without sort key");
            return Ok(None);
        };
        let (Some(rows), Some(columns)) = (
            Self::int_element(&object, tags::ROWS),
            Self::int_element(&object, tags::COLUMNS),
        ) else {
            warn!(path = %path.display(), "skipping file without image dimensions");
            return Ok(None);
        };

        Ok(Some(SliceHeader {
            path: path.to_path_buf(),
            order,
            rows,
            columns,
            position: Self::multi_float(&object, tags::IMAGE_POSITION_PATIENT)
                .and_then(|v| <[f64; 3]>::try_from(v).ok()),
            orientation: Self::multi_float(&object, tags::IMAGE_ORIENTATION_PATIENT)
                .and_then(|v| <[f64; 6]>::try_from(v).ok()),
            pixel_spacing: Self::multi_float(&object, tags::PIXEL_SPACING)
                .filter(|v| v.len() >= 2)
                .map(|v| (v[0], v[1])),
            slice_thickness: object
                .element(tags::SLICE_THICKNESS)
                .ok()
                .and_then(|element| element.to_float64().ok()),
        }))
    }

    fn int_element(
        object: &FileDicomObject<InMemDicomObject>,
        tag: dicom::core::Tag,
    ) -> Option<usize> {
        object
            .element(tag)
            .ok()?
            .to_int::<u32>()
            .ok()
            .map(|n| n as usize)
    }

    fn multi_float(
        object: &FileDicomObject<InMemDicomObject>,
        tag: dicom::core::Tag,
    ) -> Option<Vec<f64>> {
        object.element(tag).ok()?.to_multi_float64().ok()
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: &SortBy,
    ) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let pos = dicom_object
                    .element(tags::IMAGE_POSITION_PATIENT)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                Some(pos.get(2).copied())
            }
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn sort_headers(headers: &mut [SliceHeader], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            headers.sort_by(|a, b| {
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if matches!(sort_by, SortBy::ImagePositionPatient) {
            headers.reverse();
        }
    }
}

fn geometry_from_headers(headers: &[SliceHeader]) -> VolumeResult<VolumeGeometry> {
    let first = headers.first().ok_or(VolumeError::NoValidImages)?;
    if headers
        .iter()
        .any(|h| (h.rows, h.columns) != (first.rows, first.columns))
    {
        return Err(VolumeError::InconsistentDimensions);
    }

    let (row_spacing, column_spacing) = first
        .pixel_spacing
        .ok_or_else(|| VolumeError::MissingMetadata("PixelSpacing".to_string()))?;

    let position_delta = match (first.position, headers.get(1).and_then(|h| h.position)) {
        (Some(a), Some(b)) => {
            let d = ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2) + (b[2] - a[2]).powi(2)).sqrt();
            (d > f64::EPSILON).then_some(d)
        }
        _ => None,
    };
    let slice_spacing = match position_delta.or(first.slice_thickness) {
        Some(spacing) => spacing,
        None if headers.len() == 1 => 1.0,
        None => return Err(VolumeError::MissingMetadata("slice spacing".to_string())),
    };

    let mut geometry = VolumeGeometry::new((first.columns, first.rows, headers.len()), ScalarType::U16)
        .with_spacing((column_spacing, row_spacing, slice_spacing));
    if let Some([x, y, z]) = first.position {
        geometry = geometry.with_origin((x, y, z));
    }
    if let Some(o) = first.orientation {
        let row = [o[0], o[1], o[2]];
        let column = [o[3], o[4], o[5]];
        let normal = [
            row[1] * column[2] - row[2] * column[1],
            row[2] * column[0] - row[0] * column[2],
            row[0] * column[1] - row[1] * column[0],
        ];
        geometry = geometry.with_direction([
            row[0], row[1], row[2], column[0], column[1], column[2], normal[0], normal[1],
            normal[2],
        ]);
    }
    Ok(geometry)
}

/// Geometry for source references that are DICOM file paths in frame order.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomMetadata;

impl MetadataProvider for DicomMetadata {
    fn geometry(&self, source_refs: &[String]) -> VolumeResult<VolumeGeometry> {
        DicomSeries::from_file_paths(source_refs, SortBy::None)?.geometry()
    }
}

/// Decodes the DICOM file named by a task's source reference into `u16`
/// samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomFrameFetcher;

impl DicomFrameFetcher {
    fn decode_frame(path: &Path) -> Result<Vec<u8>, FrameError> {
        let object = open_file(path).map_err(|err| FrameError::Fetch(err.to_string()))?;
        let pixel_data = object
            .decode_pixel_data()
            .map_err(|err| FrameError::Decode(err.to_string()))?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::First);
        let image = pixel_data
            .to_ndarray_with_options::<u16>(&options)
            .map_err(|err| FrameError::Decode(err.to_string()))?;
        let samples: Vec<u16> = image.slice_move(s![0, .., .., 0]).iter().copied().collect();
        Ok(bytemuck::cast_slice(&samples).to_vec())
    }
}

impl FrameFetcher for DicomFrameFetcher {
    fn fetch_frame(
        &self,
        task: &FrameTask,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<u8>, FrameError>> {
        let path = PathBuf::from(&task.source_ref);
        async move {
            tokio::task::spawn_blocking(move || Self::decode_frame(&path))
                .await
                .map_err(|err| FrameError::Decode(err.to_string()))?
        }
        .boxed()
    }
}

/// Loader for `dicomdir:<directory>` ids.
pub fn dicom_directory_loader(sort_by: SortBy) -> VolumeLoaderFn {
    Arc::new(
        move |volume_id: &str, options: VolumeLoadOptions, context: &LoaderContext| {
            let directory = volume_id
                .strip_prefix(DICOM_DIR_SCHEME)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(volume_id);
            let series = DicomSeries::from_directory(directory, sort_by)?;
            let geometry = match &options.geometry {
                Some(geometry) => geometry.clone(),
                None => series.geometry()?,
            };
            let options = VolumeLoadOptions {
                source_refs: series.source_refs(),
                ..options
            };
            create_streaming_volume(volume_id, geometry, options, Arc::new(DicomFrameFetcher), context)
        },
    )
}

/// Install the `dicomdir:` and `dicomfiles:` schemes.
pub fn register_dicom_loaders(registry: &VolumeLoaderRegistry, sort_by: SortBy) {
    registry.register(DICOM_DIR_SCHEME, dicom_directory_loader(sort_by));
    registry.register(
        DICOM_FILES_SCHEME,
        streaming_loader(Arc::new(DicomMetadata), Arc::new(DicomFrameFetcher)),
    );
}
