//! Frame load scheduling.
//!
//! A load run turns every not-yet-loaded frame of a [`VolumeDescriptor`] into
//! a [`FrameTask`], pushes the tasks through the [`RequestPool`] and writes
//! each fetched frame into its slot of the volume buffer. A single driver
//! task per run consumes completions in whatever order they arrive and
//! publishes [`LoadStatusEvent`]s, so the terminal event is always the last
//! one a callback sees for that run.
//!
//! A failed frame is reported and left unloaded; the rest of the run carries
//! on. Calling `load` again later only schedules the frames still missing.

use std::{fmt, ops::Range, sync::Arc, time::Duration};

use futures::{
    FutureExt, StreamExt, channel::oneshot, future::BoxFuture, stream::FuturesUnordered,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    enums::RequestType,
    error::{FrameError, VolumeError, VolumeResult},
    pool::RequestPool,
    volume::{Commit, RunStart, VolumeDescriptor},
};

/// Progress of a load run.
///
/// One event is published per processed frame, then one terminal event once
/// every frame of the volume has been processed.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadStatusEvent {
    pub volume_id: String,
    /// For frame events, whether the frame loaded. For the terminal event,
    /// whether the whole volume is loaded.
    pub success: bool,
    /// `None` on the terminal event.
    pub frame_index: Option<usize>,
    pub frames_loaded: usize,
    pub frames_processed: usize,
    pub frame_count: usize,
    pub error: Option<FrameError>,
    pub terminal: bool,
}

pub type ProgressCallback = Arc<dyn Fn(&LoadStatusEvent) + Send + Sync>;

pub fn progress_callback<F>(f: F) -> ProgressCallback
where
    F: Fn(&LoadStatusEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fetches and decodes single frames.
///
/// The returned bytes must be exactly `task.byte_length` long. Failures are
/// reported per frame and never abort the run.
pub trait FrameFetcher: Send + Sync {
    fn fetch_frame(
        &self,
        task: &FrameTask,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<u8>, FrameError>>;
}

/// Where the frames of a volume come from: one source reference per frame,
/// in frame order.
#[derive(Clone)]
pub struct FrameSource {
    pub refs: Vec<String>,
    pub fetcher: Arc<dyn FrameFetcher>,
}

impl FrameSource {
    pub fn new(refs: Vec<String>, fetcher: Arc<dyn FrameFetcher>) -> Self {
        Self { refs, fetcher }
    }
}

impl fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSource")
            .field("refs", &self.refs.len())
            .finish_non_exhaustive()
    }
}

/// One frame to fetch. Frames are fixed size and contiguous, so
/// `byte_offset == frame_index * byte_length`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameTask {
    pub volume_id: String,
    pub frame_index: usize,
    pub source_ref: String,
    pub byte_offset: usize,
    pub byte_length: usize,
    pub priority: i32,
}

/// Order in which the frames of a run are submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameOrder {
    #[default]
    Ascending,
    Descending,
    /// Middle frame first, then outwards.
    CenterOut,
    /// The given range first, then everything else ascending.
    VisibleFirst(Range<usize>),
    /// The listed frames first, then everything else ascending.
    Custom(Vec<usize>),
}

impl FrameOrder {
    /// A permutation of `0..frame_count`.
    pub fn arrange(&self, frame_count: usize) -> Vec<usize> {
        match self {
            FrameOrder::Ascending => (0..frame_count).collect(),
            FrameOrder::Descending => (0..frame_count).rev().collect(),
            FrameOrder::CenterOut => {
                let mid = frame_count / 2;
                let mut order: Vec<usize> = (0..frame_count).collect();
                order.sort_by_key(|&i| (i.abs_diff(mid), i));
                order
            }
            FrameOrder::VisibleFirst(range) => {
                let start = range.start.min(frame_count);
                let end = range.end.clamp(start, frame_count);
                Self::prefixed((start..end).collect(), frame_count)
            }
            FrameOrder::Custom(indices) => Self::prefixed(indices.clone(), frame_count),
        }
    }

    fn prefixed(first: Vec<usize>, frame_count: usize) -> Vec<usize> {
        let mut seen = vec![false; frame_count];
        let mut order = Vec::with_capacity(frame_count);
        for index in first.into_iter().chain(0..frame_count) {
            if index < frame_count && !seen[index] {
                seen[index] = true;
                order.push(index);
            }
        }
        order
    }
}

#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub order: FrameOrder,
    pub request_type: RequestType,
    /// Pool priority of every task in the run; lower starts first.
    pub priority: i32,
    /// Per-frame limit. An expired frame fails like any other.
    pub deadline: Option<Duration>,
}

impl Default for LoadRequest {
    fn default() -> Self {
        Self {
            order: FrameOrder::Ascending,
            request_type: RequestType::Prefetch,
            priority: 0,
            deadline: None,
        }
    }
}

impl LoadRequest {
    pub fn with_order(mut self, order: FrameOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_request_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

struct PreparedRun {
    volume: Arc<VolumeDescriptor>,
    fetcher: Arc<dyn FrameFetcher>,
    run_id: u64,
    cancel: CancellationToken,
    tasks: Vec<FrameTask>,
}

type FrameCompletion = (usize, Result<Result<Commit, FrameError>, oneshot::Canceled>);

#[derive(Clone)]
pub struct FrameLoadScheduler {
    pool: RequestPool,
}

impl FrameLoadScheduler {
    pub fn new(pool: RequestPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    /// Load every missing frame in ascending order as prefetch requests.
    pub fn load(
        &self,
        volume: &Arc<VolumeDescriptor>,
        callback: ProgressCallback,
    ) -> VolumeResult<()> {
        self.load_with(volume, &LoadRequest::default(), callback)
    }

    /// Start a load run, or attach `callback` to the run already in progress.
    ///
    /// If the volume is fully loaded the callback receives a terminal success
    /// event before this returns.
    pub fn load_with(
        &self,
        volume: &Arc<VolumeDescriptor>,
        request: &LoadRequest,
        callback: ProgressCallback,
    ) -> VolumeResult<()> {
        if let Some(run) = self.prepare(volume, request, callback)? {
            self.dispatch(vec![run], request);
        }
        Ok(())
    }

    /// Load several volumes at once, alternating their frames in the pool
    /// queue (e.g. two volumes of the same acquisition).
    pub fn load_many(
        &self,
        loads: Vec<(Arc<VolumeDescriptor>, ProgressCallback)>,
        request: &LoadRequest,
    ) -> VolumeResult<()> {
        let mut runs = Vec::with_capacity(loads.len());
        for (volume, callback) in loads {
            match self.prepare(&volume, request, callback) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(err) => {
                    for run in &runs {
                        run.volume.cancel();
                    }
                    return Err(err);
                }
            }
        }
        self.dispatch(runs, request);
        Ok(())
    }

    /// Stop the volume's active run. Frames already written stay loaded.
    pub fn cancel(&self, volume: &VolumeDescriptor) {
        volume.cancel();
    }

    fn prepare(
        &self,
        volume: &Arc<VolumeDescriptor>,
        request: &LoadRequest,
        callback: ProgressCallback,
    ) -> VolumeResult<Option<PreparedRun>> {
        let source = volume
            .source()
            .ok_or_else(|| VolumeError::NoFrameSource(volume.id().to_string()))?;

        let (run_id, cancel, unloaded) = match volume.begin_run(Arc::clone(&callback))? {
            RunStart::AlreadyLoaded(event) => {
                callback(&event);
                return Ok(None);
            }
            RunStart::Joined => return Ok(None),
            RunStart::Started {
                run_id,
                cancel,
                unloaded,
            } => (run_id, cancel, unloaded),
        };

        let mut pending = vec![false; volume.frame_count()];
        for index in unloaded {
            pending[index] = true;
        }
        let frame_len = volume.frame_len();
        let tasks: Vec<FrameTask> = request
            .order
            .arrange(volume.frame_count())
            .into_iter()
            .filter(|&index| pending[index])
            .map(|index| FrameTask {
                volume_id: volume.id().to_string(),
                frame_index: index,
                source_ref: source.refs[index].clone(),
                byte_offset: index * frame_len,
                byte_length: frame_len,
                priority: request.priority,
            })
            .collect();

        debug!(
            volume_id = %volume.id(),
            run_id,
            tasks = tasks.len(),
            request_type = %request.request_type,
            "scheduling frames"
        );
        Ok(Some(PreparedRun {
            volume: Arc::clone(volume),
            fetcher: Arc::clone(&source.fetcher),
            run_id,
            cancel,
            tasks,
        }))
    }

    fn dispatch(&self, runs: Vec<PreparedRun>, request: &LoadRequest) {
        let rounds = runs.iter().map(|run| run.tasks.len()).max().unwrap_or(0);
        let mut completions: Vec<FuturesUnordered<BoxFuture<'static, FrameCompletion>>> =
            runs.iter().map(|_| FuturesUnordered::new()).collect();

        for round in 0..rounds {
            for (run, pending) in runs.iter().zip(completions.iter_mut()) {
                if let Some(task) = run.tasks.get(round) {
                    pending.push(self.submit(run, task.clone(), request));
                }
            }
        }

        for (run, pending) in runs.into_iter().zip(completions) {
            self.pool
                .spawn(drive(run.volume, run.run_id, run.cancel, pending));
        }
    }

    fn submit(
        &self,
        run: &PreparedRun,
        task: FrameTask,
        request: &LoadRequest,
    ) -> BoxFuture<'static, FrameCompletion> {
        let frame_index = task.frame_index;
        let priority = task.priority;
        let volume = Arc::clone(&run.volume);
        let fetcher = Arc::clone(&run.fetcher);
        let run_id = run.run_id;
        let cancel = run.cancel.clone();
        let deadline = request.deadline;

        let job = async move {
            let fetch = fetcher.fetch_frame(&task, cancel);
            let fetched = match deadline {
                Some(limit) => tokio::time::timeout(limit, fetch)
                    .await
                    .unwrap_or(Err(FrameError::DeadlineExpired)),
                None => fetch.await,
            };
            fetched.and_then(|bytes| volume.commit_frame(run_id, task.frame_index, &bytes))
        };

        self.pool
            .submit(request.request_type, priority, run.cancel.clone(), job)
            .map(move |result| (frame_index, result))
            .boxed()
    }
}

/// Consume the completions of one run and publish its events.
async fn drive(
    volume: Arc<VolumeDescriptor>,
    run_id: u64,
    cancel: CancellationToken,
    mut pending: FuturesUnordered<BoxFuture<'static, FrameCompletion>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = pending.next() => next,
        };
        let Some((frame_index, result)) = next else {
            break;
        };

        let outcome = match result {
            Ok(Ok(Commit::Written { newly_loaded })) => Ok(newly_loaded),
            Ok(Ok(Commit::Discarded)) => continue,
            Ok(Err(err @ FrameError::InvalidLength { .. })) => {
                error!(volume_id = %volume.id(), frame_index, %err, "fetcher returned a malformed frame");
                Err(err)
            }
            Ok(Err(err)) => {
                warn!(volume_id = %volume.id(), frame_index, %err, "frame failed to load");
                Err(err)
            }
            Err(oneshot::Canceled) if cancel.is_cancelled() => continue,
            Err(oneshot::Canceled) => {
                error!(volume_id = %volume.id(), frame_index, "frame task aborted");
                Err(FrameError::Fetch("frame task aborted".to_string()))
            }
        };

        if outcome.is_ok() {
            if let Some(observer) = volume.observer() {
                observer.frame_updated(volume.id(), frame_index);
            }
        }
        if let Some(emission) = volume.record_outcome(run_id, frame_index, outcome) {
            emission.deliver();
        }
    }
}
