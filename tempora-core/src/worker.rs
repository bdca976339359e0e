//! Bounded-concurrency debouncer.
//!
//! [`RateLimitedWorker`] runs one unit of work (typically "drain this
//! projection's queue") at most `rate` times concurrently. Requests beyond
//! that do not queue up their own execution: they join the most recently
//! scheduled run whose result is still pending, whether it is executing or
//! not, and receive that run's result. Only when that run has already
//! finished do they wait for the next run to be scheduled once a slot frees.
//!
//! A single dispatcher task owns the bookkeeping. Each run group is a list of
//! result senders that stays open until the run broadcasts its result.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, oneshot};

type Work<T> = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = T> + Send>> + Send + Sync>;

struct RunGroup<T> {
    finished: bool,
    waiters: Vec<oneshot::Sender<T>>,
}

type SharedGroup<T> = Arc<Mutex<RunGroup<T>>>;

/// Hand back a sender if the group has already broadcast its result.
fn try_join<T>(group: &SharedGroup<T>, waiter: oneshot::Sender<T>) -> Result<(), oneshot::Sender<T>> {
    let mut group = group.lock().expect("run group lock poisoned");
    if group.finished {
        return Err(waiter);
    }
    group.waiters.push(waiter);
    Ok(())
}

/// Closes the run group and frees its slot when a run ends, even by
/// panicking. Waiters left in a panicked group are dropped, so their
/// receivers error instead of hanging.
struct RunGuard<T> {
    group: SharedGroup<T>,
    freed: mpsc::UnboundedSender<()>,
}

impl<T> Drop for RunGuard<T> {
    fn drop(&mut self) {
        if let Ok(mut group) = self.group.lock() {
            group.finished = true;
            group.waiters.clear();
        }
        let _ = self.freed.send(());
    }
}

/// Handle to a dispatcher; cheap to clone. The dispatcher stops once every
/// handle is dropped and in-flight runs have finished.
pub struct RateLimitedWorker<T> {
    inbox: mpsc::UnboundedSender<oneshot::Sender<T>>,
}

impl<T> Clone for RateLimitedWorker<T> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RateLimitedWorker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedWorker").finish_non_exhaustive()
    }
}

impl<T> RateLimitedWorker<T>
where
    T: Clone + Send + 'static,
{
    /// Spawn the dispatcher on the current tokio runtime.
    ///
    /// A `rate` of zero is treated as one.
    pub fn spawn<F, Fut>(rate: usize, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let work: Work<T> = Arc::new(move || -> Pin<Box<dyn Future<Output = T> + Send>> {
            Box::pin(work())
        });
        let (inbox, requests) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rate.max(1), work, requests));
        Self { inbox }
    }

    /// Request a run and return the channel its result arrives on.
    ///
    /// The receiver errors only if the dispatcher is gone or the run
    /// panicked.
    pub fn trigger(&self) -> oneshot::Receiver<T> {
        let (waiter, result) = oneshot::channel();
        if self.inbox.send(waiter).is_err() {
            tracing::warn!("rate limited worker dispatcher has stopped");
        }
        result
    }

    /// Request a run and wait for its result.
    pub async fn run(&self) -> Option<T> {
        self.trigger().await.ok()
    }
}

async fn dispatch<T>(
    rate: usize,
    work: Work<T>,
    mut requests: mpsc::UnboundedReceiver<oneshot::Sender<T>>,
) where
    T: Clone + Send + 'static,
{
    let (slot_freed, mut freed) = mpsc::unbounded_channel();
    let mut in_flight = 0usize;
    let mut latest: Option<SharedGroup<T>> = None;
    let mut next: Vec<oneshot::Sender<T>> = Vec::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            request = requests.recv(), if accepting => match request {
                None => accepting = false,
                Some(waiter) if in_flight < rate => {
                    latest = Some(start_run(vec![waiter], &work, &slot_freed));
                    in_flight += 1;
                }
                Some(waiter) => {
                    let unjoined = match latest.as_ref() {
                        Some(group) => try_join(group, waiter).err(),
                        None => Some(waiter),
                    };
                    next.extend(unjoined);
                }
            },
            Some(()) = freed.recv() => {
                in_flight -= 1;
                if !next.is_empty() {
                    let waiters = std::mem::take(&mut next);
                    latest = Some(start_run(waiters, &work, &slot_freed));
                    in_flight += 1;
                }
            }
            else => break,
        }
        if !accepting && in_flight == 0 && next.is_empty() {
            break;
        }
    }
    tracing::trace!("rate limited worker dispatcher stopped");
}

fn start_run<T>(
    waiters: Vec<oneshot::Sender<T>>,
    work: &Work<T>,
    slot_freed: &mpsc::UnboundedSender<()>,
) -> SharedGroup<T>
where
    T: Clone + Send + 'static,
{
    let group = Arc::new(Mutex::new(RunGroup {
        finished: false,
        waiters,
    }));
    let guard = RunGuard {
        group: Arc::clone(&group),
        freed: slot_freed.clone(),
    };
    let work = Arc::clone(work);
    tokio::spawn(async move {
        let guard = guard;
        let result = work().await;
        let waiters = {
            let mut group = guard.group.lock().expect("run group lock poisoned");
            group.finished = true;
            std::mem::take(&mut group.waiters)
        };
        tracing::trace!(waiters = waiters.len(), "broadcasting run result");
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    });
    group
}
