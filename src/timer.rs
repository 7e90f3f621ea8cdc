use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

pub type TimerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A scheduling facility for one-shot deadlines. A single instance is shared by all sessions
///  of an endpoint, and each session keeps the handles of its own deadlines.
pub trait TimerService: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// A scheduled deadline. Dropping the handle does *not* cancel it.
pub struct TimerHandle {
    handle: JoinHandle<()>,
}
impl TimerHandle {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Deadlines as tasks on the tokio runtime, driven by its time driver (which is what makes
///  paused-clock tests work).
#[derive(Default)]
pub struct TokioTimerService {}

impl TokioTimerService {
    pub fn new_shared() -> Arc<dyn TimerService> {
        Arc::new(TokioTimerService::default())
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        trace!("scheduling timer in {:?}", delay);
        TimerHandle {
            handle: tokio::spawn(async move {
                time::sleep(delay).await;
                task.await;
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn flag_task(flag: Arc<AtomicBool>) -> TimerTask {
        Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = TokioTimerService::new_shared();
        let fired = Arc::new(AtomicBool::new(false));

        let handle = timer.schedule(Duration::from_secs(5), flag_task(fired.clone()));

        time::sleep(Duration::from_millis(4999)).await;
        assert!(!fired.load(Ordering::SeqCst));

        time::sleep(Duration::from_millis(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let timer = TokioTimerService::new_shared();
        let fired = Arc::new(AtomicBool::new(false));

        let handle = timer.schedule(Duration::from_secs(5), flag_task(fired.clone()));
        time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
