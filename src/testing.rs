//! Deterministic frame sources and recorders for exercising load runs
//! without real image data.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{FrameError, VolumeResult},
    scheduler::{FrameFetcher, FrameTask, LoadStatusEvent, ProgressCallback, progress_callback},
    volume::{MetadataProvider, VolumeGeometry, VolumeObserver},
};

/// Bytes [`MockFetcher`] produces for `frame_index`: every byte is
/// `frame_index % 251 + 1`, so no frame looks like the zeroed buffer.
pub fn frame_pattern(frame_index: usize, frame_len: usize) -> Vec<u8> {
    vec![(frame_index % 251) as u8 + 1; frame_len]
}

#[derive(Default)]
struct Gates {
    open: bool,
    frames: HashMap<usize, Arc<Semaphore>>,
}

impl Gates {
    fn gate(&mut self, frame_index: usize) -> Option<Arc<Semaphore>> {
        if self.open {
            return None;
        }
        Some(Arc::clone(
            self.frames
                .entry(frame_index)
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        ))
    }
}

/// In-memory [`FrameFetcher`] with scripted failures, delays and gates.
#[derive(Default)]
pub struct MockFetcher {
    frame_len: usize,
    failing: HashSet<usize>,
    wrong_length: HashSet<usize>,
    delays: HashMap<usize, Duration>,
    gates: Option<Arc<Mutex<Gates>>>,
    started: Arc<Mutex<Vec<usize>>>,
}

impl MockFetcher {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            ..Self::default()
        }
    }

    /// Frames whose fetch fails with [`FrameError::Fetch`].
    pub fn failing(mut self, frames: &[usize]) -> Self {
        self.failing.extend(frames);
        self
    }

    /// Frames fetched one byte short.
    pub fn wrong_length(mut self, frames: &[usize]) -> Self {
        self.wrong_length.extend(frames);
        self
    }

    pub fn with_delay(mut self, frame_index: usize, delay: Duration) -> Self {
        self.delays.insert(frame_index, delay);
        self
    }

    /// Hold every fetch until its frame is released.
    pub fn gated(mut self) -> Self {
        self.gates = Some(Arc::new(Mutex::new(Gates::default())));
        self
    }

    pub fn release(&self, frame_index: usize) {
        if let Some(gates) = &self.gates {
            if let Some(gate) = gates.lock().gate(frame_index) {
                gate.add_permits(1);
            }
        }
    }

    /// Release every held fetch and stop gating.
    pub fn release_all(&self) {
        if let Some(gates) = &self.gates {
            let mut gates = gates.lock();
            gates.open = true;
            for gate in gates.frames.values() {
                gate.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        }
    }

    /// Frame indices in the order their fetch started.
    pub fn started(&self) -> Vec<usize> {
        self.started.lock().clone()
    }
}

impl FrameFetcher for MockFetcher {
    fn fetch_frame(
        &self,
        task: &FrameTask,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<u8>, FrameError>> {
        let frame_index = task.frame_index;
        self.started.lock().push(frame_index);

        let gate = self
            .gates
            .as_ref()
            .and_then(|gates| gates.lock().gate(frame_index));
        let delay = self.delays.get(&frame_index).copied();
        let fails = self.failing.contains(&frame_index);
        let len = if self.wrong_length.contains(&frame_index) {
            self.frame_len.saturating_sub(1)
        } else {
            self.frame_len
        };

        async move {
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|err| FrameError::Fetch(err.to_string()))?;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fails {
                return Err(FrameError::Fetch(format!("frame {frame_index} unavailable")));
            }
            Ok(frame_pattern(frame_index, len))
        }
        .boxed()
    }
}

/// [`MetadataProvider`] answering with the same geometry for any reference
/// list.
#[derive(Clone, Debug)]
pub struct StaticMetadata(pub VolumeGeometry);

impl MetadataProvider for StaticMetadata {
    fn geometry(&self, _source_refs: &[String]) -> VolumeResult<VolumeGeometry> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverCall {
    FrameUpdated(String, usize),
    BufferReallocated(String),
    VolumeReleased(String),
}

#[derive(Default)]
pub struct RecordingObserver {
    calls: Mutex<Vec<ObserverCall>>,
}

impl RecordingObserver {
    pub fn calls(&self) -> Vec<ObserverCall> {
        self.calls.lock().clone()
    }
}

impl VolumeObserver for RecordingObserver {
    fn frame_updated(&self, volume_id: &str, frame_index: usize) {
        self.calls
            .lock()
            .push(ObserverCall::FrameUpdated(volume_id.to_string(), frame_index));
    }

    fn buffer_reallocated(&self, volume_id: &str) {
        self.calls
            .lock()
            .push(ObserverCall::BufferReallocated(volume_id.to_string()));
    }

    fn volume_released(&self, volume_id: &str) {
        self.calls
            .lock()
            .push(ObserverCall::VolumeReleased(volume_id.to_string()));
    }
}

#[derive(Default)]
struct Recorded {
    events: Mutex<Vec<LoadStatusEvent>>,
    notify: Notify,
}

/// Collects the events of a progress callback and lets a test await them.
#[derive(Clone, Default)]
pub struct EventRecorder {
    inner: Arc<Recorded>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> ProgressCallback {
        let inner = Arc::clone(&self.inner);
        progress_callback(move |event: &LoadStatusEvent| {
            inner.events.lock().push(event.clone());
            inner.notify.notify_waiters();
        })
    }

    pub fn events(&self) -> Vec<LoadStatusEvent> {
        self.inner.events.lock().clone()
    }

    /// Per-frame events only.
    pub fn frame_events(&self) -> Vec<LoadStatusEvent> {
        self.events().into_iter().filter(|e| !e.terminal).collect()
    }

    pub fn terminal(&self) -> Option<LoadStatusEvent> {
        self.events().into_iter().find(|e| e.terminal)
    }

    /// Wait until `done` holds for the recorded events.
    pub async fn wait_until(&self, done: impl Fn(&[LoadStatusEvent]) -> bool) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(&self.inner.events.lock()) {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_frames(&self, count: usize) {
        self.wait_until(|events| events.iter().filter(|e| !e.terminal).count() >= count)
            .await;
    }

    pub async fn wait_terminal(&self) -> LoadStatusEvent {
        loop {
            if let Some(event) = self.terminal() {
                return event;
            }
            self.wait_until(|events| events.iter().any(|e| e.terminal))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(frame_index: usize) -> FrameTask {
        FrameTask {
            volume_id: "mock:v".to_string(),
            frame_index,
            source_ref: format!("frame-{frame_index}"),
            byte_offset: 0,
            byte_length: 4,
            priority: 0,
        }
    }

    #[tokio::test]
    async fn scripted_outcomes() {
        let fetcher = MockFetcher::new(4).failing(&[1]).wrong_length(&[2]);
        let cancel = CancellationToken::new();

        assert_eq!(
            fetcher.fetch_frame(&task(0), cancel.clone()).await,
            Ok(vec![1; 4])
        );
        assert!(matches!(
            fetcher.fetch_frame(&task(1), cancel.clone()).await,
            Err(FrameError::Fetch(_))
        ));
        assert_eq!(
            fetcher.fetch_frame(&task(2), cancel).await.map(|b| b.len()),
            Ok(3)
        );
        assert_eq!(fetcher.started(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn gated_fetch_waits_for_release() {
        let fetcher = MockFetcher::new(2).gated();
        let mut pending = fetcher.fetch_frame(&task(5), CancellationToken::new());
        assert!((&mut pending).now_or_never().is_none());

        fetcher.release(5);
        assert_eq!(pending.await, Ok(vec![6, 6]));
    }

    #[tokio::test]
    async fn recorder_wakes_on_terminal_event() {
        let recorder = EventRecorder::new();
        let callback = recorder.callback();
        let waiter = tokio::spawn({
            let recorder = recorder.clone();
            async move { recorder.wait_terminal().await }
        });

        let mut event = LoadStatusEvent {
            volume_id: "mock:v".to_string(),
            success: true,
            frame_index: Some(0),
            frames_loaded: 1,
            frames_processed: 1,
            frame_count: 1,
            error: None,
            terminal: false,
        };
        callback(&event);
        event.frame_index = None;
        event.terminal = true;
        callback(&event);

        assert!(waiter.await.unwrap().terminal);
        assert_eq!(recorder.frame_events().len(), 1);
    }
}
