use std::{future::Future, sync::Arc, time::Duration};

use dicom_volume_stream::{
    Cache, CacheError, CacheEvent, CacheOptions, FrameError, FrameFetcher, FrameOrder,
    LoadRequest, ManagerOptions, PoolOptions, RequestType, ScalarType, VolumeDescriptor,
    VolumeError, VolumeGeometry, VolumeLoadOptions, VolumeManager, streaming_loader,
    testing::{
        EventRecorder, MockFetcher, ObserverCall, RecordingObserver, StaticMetadata, frame_pattern,
    },
};
use rstest::rstest;
use tokio::sync::broadcast::error::TryRecvError;

const FRAME_LEN: usize = 4 * 4;

fn geometry(frames: usize) -> VolumeGeometry {
    VolumeGeometry::new((4, 4, frames), ScalarType::U8)
}

fn refs(frames: usize) -> Vec<String> {
    (0..frames).map(|i| format!("frame-{i}")).collect()
}

fn manager(prefetch: usize) -> VolumeManager {
    let pool = PoolOptions::default().with_max_concurrency(RequestType::Prefetch, prefetch);
    VolumeManager::new(ManagerOptions::default().with_pool(pool)).unwrap()
}

fn register(manager: &VolumeManager, fetcher: &Arc<MockFetcher>, frames: usize) {
    let fetcher: Arc<dyn FrameFetcher> = Arc::clone(fetcher) as Arc<dyn FrameFetcher>;
    manager.register_volume_loader(
        "mock",
        streaming_loader(Arc::new(StaticMetadata(geometry(frames))), fetcher),
    );
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("load did not finish in time")
}

fn expected_buffer(frames: usize) -> Vec<u8> {
    (0..frames).flat_map(|i| frame_pattern(i, FRAME_LEN)).collect()
}

#[tokio::test]
async fn failed_frame_is_reported_and_left_unloaded() {
    let manager = manager(5);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN).failing(&[3]));
    register(&manager, &fetcher, 10);

    let recorder = EventRecorder::new();
    let volume = manager
        .create_volume(
            "mock:a",
            VolumeLoadOptions::new(refs(10)).start_loading(recorder.callback()),
        )
        .unwrap();
    let terminal = within(recorder.wait_terminal()).await;

    assert!(!terminal.success);
    assert_eq!(terminal.frames_processed, 10);
    assert_eq!(terminal.frames_loaded, 9);
    assert!(recorder.events().last().unwrap().terminal);

    let failed: Vec<_> = recorder
        .frame_events()
        .into_iter()
        .filter(|e| !e.success)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].frame_index, Some(3));
    assert!(matches!(failed[0].error, Some(FrameError::Fetch(_))));

    assert!(!volume.frame_loaded(3));
    assert_eq!(volume.frames_loaded(), 9);
    assert!(!volume.is_loaded());
    assert!(!volume.is_loading());
    assert!(volume.with_frame(3, |b| b.iter().all(|&x| x == 0)).unwrap());
    assert_eq!(volume.with_frame(4, <[u8]>::to_vec).unwrap(), frame_pattern(4, FRAME_LEN));
}

#[tokio::test]
async fn malformed_frame_does_not_touch_the_buffer() {
    let manager = manager(5);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN).wrong_length(&[1]));
    register(&manager, &fetcher, 3);

    let recorder = EventRecorder::new();
    let volume = manager
        .create_volume(
            "mock:short",
            VolumeLoadOptions::new(refs(3)).start_loading(recorder.callback()),
        )
        .unwrap();
    within(recorder.wait_terminal()).await;

    let failed = recorder
        .frame_events()
        .into_iter()
        .find(|e| e.frame_index == Some(1))
        .unwrap();
    assert_eq!(
        failed.error,
        Some(FrameError::InvalidLength {
            expected: FRAME_LEN,
            actual: FRAME_LEN - 1
        })
    );
    assert!(!volume.frame_loaded(1));
    assert!(volume.with_frame(1, |b| b.iter().all(|&x| x == 0)).unwrap());
}

#[test]
fn over_budget_volume_is_rejected_before_allocation() {
    let cache = Cache::new(CacheOptions::default().with_max_bytes(10 * FRAME_LEN as u64 - 1));
    let mut events = cache.subscribe();

    let err = VolumeDescriptor::create(&cache, "mock:big", geometry(10), None, None).unwrap_err();

    assert!(matches!(
        err,
        VolumeError::Cache(CacheError::CacheSizeExceeded {
            requested: 160,
            available: 159,
            max_size: 159
        })
    ));
    assert!(cache.is_empty());
    assert_eq!(cache.current_size(), 0);
    assert_eq!(cache.reserved_size(), 0);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn cancel_stops_the_run_and_discards_late_frames() {
    let manager = manager(20);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN).gated());
    register(&manager, &fetcher, 20);

    let recorder = EventRecorder::new();
    let volume = manager
        .create_volume(
            "mock:c",
            VolumeLoadOptions::new(refs(20)).start_loading(recorder.callback()),
        )
        .unwrap();
    for frame in 0..5 {
        fetcher.release(frame);
    }
    within(recorder.wait_for_frames(5)).await;

    manager.cancel_load("mock:c").unwrap();
    assert!(!volume.is_loading());
    assert_eq!(volume.pending_callback_count(), 0);
    assert_eq!(volume.frames_loaded(), 5);
    let mask = volume.frame_loaded_mask();
    assert!(mask[..5].iter().all(|loaded| *loaded));
    assert!(mask[5..].iter().all(|loaded| !*loaded));

    let before = volume.snapshot().unwrap();
    fetcher.release_all();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(volume.snapshot().unwrap(), before);
    assert_eq!(volume.frames_loaded(), 5);
    assert_eq!(recorder.events().len(), 5);
    assert!(recorder.terminal().is_none());
}

#[tokio::test]
async fn purged_volume_is_recreated_fresh() {
    let manager = manager(5);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN));
    register(&manager, &fetcher, 4);

    let recorder = EventRecorder::new();
    let first = manager
        .create_volume(
            "mock:d",
            VolumeLoadOptions::new(refs(4)).start_loading(recorder.callback()),
        )
        .unwrap();
    assert!(within(recorder.wait_terminal()).await.success);
    assert_eq!(manager.get_cache_size(), 4 * FRAME_LEN as u64);

    manager.purge_cache();
    assert!(first.is_released());
    assert!(manager.get_volume("mock:d").is_none());
    assert_eq!(manager.get_cache_size(), 0);

    let second = manager
        .create_volume("mock:d", VolumeLoadOptions::new(refs(4)))
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.frames_loaded(), 0);
    assert!(!second.is_loading());
    assert!(second.snapshot().unwrap().iter().all(|&b| b == 0));
    assert_eq!(manager.get_cache_size(), 4 * FRAME_LEN as u64);
}

#[tokio::test]
async fn second_load_only_fetches_missing_frames() {
    let manager = manager(3);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN).gated());
    register(&manager, &fetcher, 8);

    let first = EventRecorder::new();
    let volume = manager
        .create_volume(
            "mock:resume",
            VolumeLoadOptions::new(refs(8)).start_loading(first.callback()),
        )
        .unwrap();
    for frame in 0..3 {
        fetcher.release(frame);
    }
    within(first.wait_for_frames(3)).await;
    manager.cancel_load("mock:resume").unwrap();
    fetcher.release_all();

    let second = EventRecorder::new();
    manager.load("mock:resume", second.callback()).unwrap();
    let terminal = within(second.wait_terminal()).await;

    assert!(terminal.success);
    assert_eq!(terminal.frames_loaded, 8);
    assert_eq!(terminal.frames_processed, 8);
    assert_eq!(second.frame_events().len(), 5);
    assert!(volume.is_loaded());
    assert_eq!(volume.snapshot().unwrap(), expected_buffer(8));

    let started = fetcher.started();
    for frame in 0..3 {
        assert_eq!(started.iter().filter(|&&i| i == frame).count(), 1);
    }
}

#[rstest]
#[case::ascending_delays(vec![0, 5, 10, 15, 20, 25])]
#[case::descending_delays(vec![25, 20, 15, 10, 5, 0])]
#[case::mixed_delays(vec![15, 0, 25, 5, 20, 10])]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_order_does_not_change_the_result(#[case] delays_ms: Vec<u64>) {
    let manager = manager(6);
    let fetcher = delays_ms
        .iter()
        .enumerate()
        .fold(MockFetcher::new(FRAME_LEN), |fetcher, (frame, ms)| {
            fetcher.with_delay(frame, Duration::from_millis(*ms))
        });
    let fetcher = Arc::new(fetcher);
    register(&manager, &fetcher, 6);

    let recorder = EventRecorder::new();
    let volume = manager
        .create_volume(
            "mock:order",
            VolumeLoadOptions::new(refs(6)).start_loading(recorder.callback()),
        )
        .unwrap();
    let terminal = within(recorder.wait_terminal()).await;

    assert!(terminal.success);
    assert_eq!(volume.snapshot().unwrap(), expected_buffer(6));
    let processed: Vec<_> = recorder
        .frame_events()
        .iter()
        .map(|e| e.frames_processed)
        .collect();
    assert_eq!(processed, (1..=6).collect::<Vec<_>>());
}

#[tokio::test]
async fn load_joins_the_run_in_progress() {
    let manager = manager(4);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN).gated());
    register(&manager, &fetcher, 4);

    let first = EventRecorder::new();
    manager
        .create_volume(
            "mock:join",
            VolumeLoadOptions::new(refs(4)).start_loading(first.callback()),
        )
        .unwrap();
    let second = EventRecorder::new();
    manager.load("mock:join", second.callback()).unwrap();
    let volume = manager.get_volume("mock:join").unwrap();
    assert_eq!(volume.pending_callback_count(), 2);

    fetcher.release_all();
    assert!(within(first.wait_terminal()).await.success);
    assert!(within(second.wait_terminal()).await.success);
    assert_eq!(fetcher.started().len(), 4);
    assert_eq!(volume.pending_callback_count(), 0);
}

#[tokio::test]
async fn load_on_a_loaded_volume_reports_success_immediately() {
    let manager = manager(4);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN));
    register(&manager, &fetcher, 2);

    let recorder = EventRecorder::new();
    manager
        .create_volume(
            "mock:done",
            VolumeLoadOptions::new(refs(2)).start_loading(recorder.callback()),
        )
        .unwrap();
    within(recorder.wait_terminal()).await;

    let again = EventRecorder::new();
    manager.load("mock:done", again.callback()).unwrap();
    let events = again.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].terminal && events[0].success);
    assert_eq!(events[0].frames_loaded, 2);
    assert_eq!(fetcher.started().len(), 2);
}

#[tokio::test]
async fn deadline_expiry_fails_the_frame() {
    let manager = manager(4);
    let fetcher = Arc::new(
        MockFetcher::new(FRAME_LEN).with_delay(2, Duration::from_millis(500)),
    );
    register(&manager, &fetcher, 3);
    manager
        .create_volume("mock:slow", VolumeLoadOptions::new(refs(3)))
        .unwrap();

    let recorder = EventRecorder::new();
    let request = LoadRequest::default().with_deadline(Duration::from_millis(20));
    manager
        .load_with("mock:slow", &request, recorder.callback())
        .unwrap();
    let terminal = within(recorder.wait_terminal()).await;

    assert!(!terminal.success);
    assert_eq!(terminal.frames_loaded, 2);
    let expired = recorder
        .frame_events()
        .into_iter()
        .find(|e| e.frame_index == Some(2))
        .unwrap();
    assert_eq!(expired.error, Some(FrameError::DeadlineExpired));
}

#[tokio::test]
async fn visible_frames_are_fetched_first() {
    let manager = manager(1);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN));
    register(&manager, &fetcher, 6);
    manager
        .create_volume("mock:view", VolumeLoadOptions::new(refs(6)))
        .unwrap();

    let recorder = EventRecorder::new();
    let request = LoadRequest::default()
        .with_order(FrameOrder::VisibleFirst(3..5))
        .with_request_type(RequestType::Prefetch);
    manager
        .load_with("mock:view", &request, recorder.callback())
        .unwrap();
    within(recorder.wait_terminal()).await;

    assert_eq!(fetcher.started(), vec![3, 4, 0, 1, 2, 5]);
}

#[tokio::test]
async fn load_many_completes_every_volume() {
    let manager = manager(2);
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN));
    register(&manager, &fetcher, 3);
    let a = manager
        .create_volume("mock:a", VolumeLoadOptions::new(refs(3)))
        .unwrap();
    let b = manager
        .create_volume("mock:b", VolumeLoadOptions::new(refs(3)))
        .unwrap();

    let (ra, rb) = (EventRecorder::new(), EventRecorder::new());
    manager
        .scheduler()
        .load_many(
            vec![
                (Arc::clone(&a), ra.callback()),
                (Arc::clone(&b), rb.callback()),
            ],
            &LoadRequest::default(),
        )
        .unwrap();

    assert!(within(ra.wait_terminal()).await.success);
    assert!(within(rb.wait_terminal()).await.success);
    assert_eq!(a.snapshot().unwrap(), expected_buffer(3));
    assert_eq!(b.snapshot().unwrap(), expected_buffer(3));
    assert_eq!(fetcher.started(), vec![0, 0, 1, 1, 2, 2]);
}

#[tokio::test]
async fn manager_reports_unknown_volumes() {
    let manager = manager(1);
    let recorder = EventRecorder::new();

    assert!(matches!(
        manager.load("mock:none", recorder.callback()),
        Err(VolumeError::VolumeNotFound(_))
    ));
    assert!(matches!(
        manager.cancel_load("mock:none"),
        Err(VolumeError::VolumeNotFound(_))
    ));
    assert!(matches!(
        manager.decache_volume("mock:none"),
        Err(VolumeError::VolumeNotFound(_))
    ));
    assert!(matches!(
        manager.create_volume("mock:none", VolumeLoadOptions::default()),
        Err(VolumeError::UnknownScheme(_))
    ));
}

#[tokio::test]
async fn manager_cache_surface() {
    let manager = VolumeManager::new(
        ManagerOptions::default().with_cache(CacheOptions::default().with_max_bytes(1024)),
    )
    .unwrap();
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN));
    register(&manager, &fetcher, 4);
    let mut events = manager.subscribe();

    manager
        .create_volume("mock:s", VolumeLoadOptions::new(refs(4)))
        .unwrap();
    assert_eq!(manager.get_max_cache_size(), 1024);
    assert_eq!(manager.get_cache_size(), 64);
    assert!(matches!(
        events.try_recv(),
        Ok(CacheEvent::EntryAdded { size_bytes: 64, .. })
    ));

    assert!(matches!(
        manager.set_max_cache_size(32),
        Err(CacheError::MaxSizeBelowUsage { requested: 32, current: 64 })
    ));
    manager.set_max_cache_size(64).unwrap();
    assert_eq!(manager.get_max_cache_size(), 64);

    manager.decache_volume("mock:s").unwrap();
    assert_eq!(manager.get_cache_size(), 0);
    assert!(manager.get_volume("mock:s").is_none());
}

#[tokio::test]
async fn observer_sees_allocation_frames_and_release() {
    let observer = Arc::new(RecordingObserver::default());
    let manager = manager(1).with_observer(observer.clone());
    let fetcher = Arc::new(MockFetcher::new(FRAME_LEN));
    register(&manager, &fetcher, 2);

    let recorder = EventRecorder::new();
    manager
        .create_volume(
            "mock:o",
            VolumeLoadOptions::new(refs(2)).start_loading(recorder.callback()),
        )
        .unwrap();
    within(recorder.wait_terminal()).await;
    manager.decache_volume("mock:o").unwrap();

    let id = "mock:o".to_string();
    assert_eq!(
        observer.calls(),
        vec![
            ObserverCall::BufferReallocated(id.clone()),
            ObserverCall::FrameUpdated(id.clone(), 0),
            ObserverCall::FrameUpdated(id.clone(), 1),
            ObserverCall::VolumeReleased(id),
        ]
    );
}
