//! Cancellable background task scheduler.
//!
//! Every component that runs periodic work (idle sweep, disk health monitor,
//! recovery scheduler) owns one `TaskScheduler`. Tasks are started by the
//! component on construction and stopped when the component drains; nothing
//! runs on an ambient timer without an owner.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Owner of a component's background tasks.
#[derive(Debug)]
pub struct TaskScheduler {
    name: &'static str,
    token: CancellationToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskScheduler {
    /// Create a scheduler for the named component.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A token that is cancelled when the scheduler stops.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.handles
            .lock()
            .expect("scheduler mutex poisoned")
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    /// Run `tick` every `period`, starting one period from now.
    ///
    /// A tick in progress is abandoned when the scheduler stops.
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token();
        let component = self.name;
        self.spawn_with_token(task, token.clone(), async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            tracing::debug!(component, task, "Periodic task stopped");
        });
    }

    /// Run a long-lived task that receives its own cancellation token.
    pub fn spawn<F, Fut>(&self, task: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token();
        let fut = f(token.clone());
        self.spawn_with_token(task, token, fut);
    }

    fn spawn_with_token<Fut>(&self, task: &'static str, token: CancellationToken, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if token.is_cancelled() {
            tracing::debug!(component = self.name, task, "Scheduler stopped, task not started");
            return;
        }
        let handle = tokio::spawn(fut);
        let mut handles = self.handles.lock().expect("scheduler mutex poisoned");
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((task, handle));
    }

    /// Cancel every task and wait up to `grace` for them to exit.
    ///
    /// Tasks still running after the grace period are aborted.
    pub async fn stop(&self, grace: Duration) {
        self.token.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().expect("scheduler mutex poisoned"));
        let deadline = Instant::now() + grace;

        for (task, handle) in handles {
            let abort = handle.abort_handle();
            if time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!(component = self.name, task, "Task did not stop within grace period, aborting");
                abort.abort();
            }
        }
        tracing::debug!(component = self.name, "Scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_on_schedule() {
        let scheduler = TaskScheduler::new("test");
        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();
        scheduler.spawn_periodic("counter", Duration::from_secs(60), move || {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_secs(59)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scheduler.stop(Duration::from_secs(1)).await;
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_long_task() {
        let scheduler = TaskScheduler::new("test");
        let exited = Arc::new(AtomicU32::new(0));
        let e = exited.clone();
        scheduler.spawn("waiter", move |token| async move {
            token.cancelled().await;
            e.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.stop(Duration::from_secs(1)).await;
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_task_is_aborted_after_grace() {
        let scheduler = TaskScheduler::new("test");
        scheduler.spawn("stubborn", |_token| async move {
            time::sleep(Duration::from_secs(3600)).await;
        });

        scheduler.stop(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(scheduler.running(), 0);
    }
}
