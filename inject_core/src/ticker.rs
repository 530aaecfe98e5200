use std::ops::ControlFlow;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, trace};

/// Runs a task on its own thread at a fixed period until cancelled.
///
/// The task never overlaps itself. Ticks that pile up while it runs are
/// dropped rather than replayed. Returning `ControlFlow::Break` from the
/// task stops the ticker.
pub struct Ticker {
    name: String,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let name = name.into();
        let (cancel, cancelled) = bounded::<()>(0);
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let ticks = tick(period);
            loop {
                select! {
                    recv(cancelled) -> _ => break,
                    recv(ticks) -> scheduled => {
                        let Ok(scheduled) = scheduled else { break };
                        if scheduled.elapsed() > period {
                            trace!(target: "inject::ticker", name = %thread_name, "tick.skipped=late");
                            continue;
                        }
                        if task().is_break() {
                            debug!(target: "inject::ticker", name = %thread_name, "tick.stopped=task");
                            break;
                        }
                    }
                }
            }
        })?;
        Ok(Self {
            name,
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the ticker. Waits for an in-flight tick unless called from the
    /// ticker's own task.
    pub fn cancel(&mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|handle| handle.thread().id())
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn remaining(deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }

    #[test]
    fn runs_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut ticker = Ticker::spawn("test-ticker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && remaining(deadline) > Duration::ZERO {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ticker.is_running());
        ticker.cancel();
        let stopped_at = count.load(Ordering::SeqCst);
        assert!(stopped_at >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
        assert!(!ticker.is_running());
    }

    #[test]
    fn slow_task_is_not_queued_up() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut ticker = Ticker::spawn("slow-ticker", Duration::from_millis(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(40));
            ControlFlow::Continue(())
        })
        .unwrap();
        thread::sleep(Duration::from_millis(200));
        ticker.cancel();
        // 200ms of 40ms runs leaves room for at most a handful of ticks.
        assert!(count.load(Ordering::SeqCst) <= 6);
    }

    #[test]
    fn break_stops_the_thread() {
        let mut ticker =
            Ticker::spawn("one-shot", Duration::from_millis(1), || ControlFlow::Break(())).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ticker.is_running() && remaining(deadline) > Duration::ZERO {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!ticker.is_running());
        ticker.cancel();
    }
}
