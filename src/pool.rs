//! Bounded executor for fetch/decode requests.
//!
//! Every [`RequestType`] has its own queue and concurrency limit. Within a
//! queue lower `priority` values start first and equal priorities start in
//! submission order. The pool knows nothing about volumes or frames; it runs
//! futures and hands their output back through a oneshot channel.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
};

use futures::{FutureExt, channel::oneshot, future::BoxFuture};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    config::PoolOptions,
    enums::RequestType,
    error::{VolumeError, VolumeResult},
};

struct Queued {
    priority: i32,
    seq: u64,
    cancel: CancellationToken,
    job: BoxFuture<'static, ()>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap pops the greatest element: invert so the lowest priority
    // value, then the oldest submission, comes out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Lane {
    queue: BinaryHeap<Queued>,
    in_flight: usize,
    max_concurrency: usize,
}

struct PoolInner {
    lanes: [Mutex<Lane>; 4],
    seq: AtomicU64,
    handle: Handle,
}

/// Releases a lane slot when a job finishes, even by panicking.
struct SlotGuard {
    pool: RequestPool,
    request_type: RequestType,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.inner.lanes[self.request_type.index()].lock().in_flight -= 1;
        self.pool.pump(self.request_type);
    }
}

#[derive(Clone)]
pub struct RequestPool {
    inner: Arc<PoolInner>,
}

impl RequestPool {
    pub fn new(handle: Handle, options: &PoolOptions) -> Self {
        let lane = |request_type| {
            Mutex::new(Lane {
                queue: BinaryHeap::new(),
                in_flight: 0,
                max_concurrency: options.max_concurrency(request_type),
            })
        };
        Self {
            inner: Arc::new(PoolInner {
                lanes: RequestType::ALL.map(lane),
                seq: AtomicU64::new(0),
                handle,
            }),
        }
    }

    /// Pool bound to the runtime the caller is running in.
    pub fn current(options: &PoolOptions) -> VolumeResult<Self> {
        let handle = Handle::try_current().map_err(|_| VolumeError::NoRuntime)?;
        Ok(Self::new(handle, options))
    }

    /// Queue `fut` under `request_type`.
    ///
    /// The receiver yields the future's output. It is cancelled without a
    /// value if `cancel` fires before or while the future runs.
    pub fn submit<F, T>(
        &self,
        request_type: RequestType,
        priority: i32,
        cancel: CancellationToken,
        fut: F,
    ) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = cancel.clone();
        let job = async move {
            tokio::select! {
                _ = token.cancelled() => {}
                out = fut => {
                    let _ = tx.send(out);
                }
            }
        }
        .boxed();

        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.lanes[request_type.index()].lock().queue.push(Queued {
            priority,
            seq,
            cancel,
            job,
        });
        trace!(%request_type, priority, seq, "request queued");
        self.pump(request_type);
        rx
    }

    /// Start queued jobs while the lane has free slots.
    fn pump(&self, request_type: RequestType) {
        let mut ready = Vec::new();
        {
            let mut lane = self.inner.lanes[request_type.index()].lock();
            while lane.in_flight < lane.max_concurrency {
                let Some(queued) = lane.queue.pop() else {
                    break;
                };
                if queued.cancel.is_cancelled() {
                    trace!(%request_type, seq = queued.seq, "dropping cancelled request");
                    continue;
                }
                lane.in_flight += 1;
                ready.push(queued);
            }
        }

        // Spawn outside the lane lock: a job dropped by the runtime releases
        // its slot through the guard, which locks the lane again.
        for queued in ready {
            let guard = SlotGuard {
                pool: self.clone(),
                request_type,
            };
            self.inner.handle.spawn(async move {
                let _guard = guard;
                queued.job.await;
            });
        }
    }

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(fut);
    }

    /// Change a lane's limit. Zero pauses the lane.
    pub fn set_max_concurrency(&self, request_type: RequestType, max: usize) {
        self.inner.lanes[request_type.index()].lock().max_concurrency = max;
        self.pump(request_type);
    }

    pub fn max_concurrency(&self, request_type: RequestType) -> usize {
        self.inner.lanes[request_type.index()].lock().max_concurrency
    }

    pub fn in_flight(&self, request_type: RequestType) -> usize {
        self.inner.lanes[request_type.index()].lock().in_flight
    }

    pub fn queued(&self, request_type: RequestType) -> usize {
        self.inner.lanes[request_type.index()].lock().queue.len()
    }

    /// Drop every queued, not yet started request of `request_type`.
    pub fn clear(&self, request_type: RequestType) -> usize {
        let mut lane = self.inner.lanes[request_type.index()].lock();
        let dropped = lane.queue.len();
        lane.queue.clear();
        dropped
    }
}
