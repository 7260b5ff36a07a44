use std::{env, error::Error};

use dicom_volume_stream::{
    LoadStatusEvent, ManagerOptions, Orientation, SortBy, VolumeLoadOptions, VolumeManager,
    dicom_source::{DICOM_DIR_SCHEME, register_dicom_loaders},
    progress_callback,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let directory = env::args().nth(1).unwrap_or_else(|| "dicom".to_string());
    let manager = VolumeManager::new(ManagerOptions::default())?;
    register_dicom_loaders(manager.registry(), SortBy::InstanceNumber);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = progress_callback(move |event: &LoadStatusEvent| {
        let _ = tx.send(event.clone());
    });
    let volume = manager.create_volume(
        &format!("{DICOM_DIR_SCHEME}:{directory}"),
        VolumeLoadOptions::default().start_loading(callback),
    )?;

    while let Some(event) = rx.recv().await {
        if event.terminal {
            info!(
                frames_loaded = event.frames_loaded,
                frame_count = event.frame_count,
                "volume loaded"
            );
            break;
        }
        if let Some(err) = &event.error {
            warn!(frame_index = ?event.frame_index, %err, "frame skipped");
        }
    }

    let image = volume.slice_image(volume.dims().2 / 2, Orientation::Axial)?;
    image.save("result.png")?;
    info!(
        cache_bytes = manager.get_cache_size(),
        "saved centre slice to result.png"
    );
    Ok(())
}
