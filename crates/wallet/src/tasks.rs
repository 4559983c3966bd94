//! Background task plumbing for the stake and resend loops.
//!
//! The node owns the wallet behind its lock; these helpers only provide the
//! periodic scheduling and clean shutdown. The tick closure runs on its own
//! thread until the handle is stopped or dropped.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

pub struct PeriodicTask {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
    name: &'static str,
}

impl PeriodicTask {
    /// Run `tick` every `interval` until stopped. The first tick fires after
    /// one full interval.
    pub fn spawn(
        name: &'static str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Self {
        let (shutdown, stop) = bounded::<()>(1);
        let thread = std::thread::spawn(move || loop {
            match stop.recv_timeout(interval) {
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => tick(),
            }
        });
        umbra_log::log_debug!("started {name} task");
        Self {
            shutdown,
            thread: Some(thread),
            name,
        }
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            umbra_log::log_debug!("stopped {} task", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ticks_then_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let task = PeriodicTask::spawn("test", Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(40));
        task.stop();
        let ticks = counter.load(Ordering::Relaxed);
        assert!(ticks >= 2, "expected a few ticks, got {ticks}");
        let after = counter.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Relaxed), after);
    }
}
