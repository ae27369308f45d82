//! Cancellable scheduled tasks keyed by purpose
//!
//! At most one task per [`TimerKind`] is alive. Arming a kind aborts the task
//! already registered under it, so rapid reconnects never leave duplicate tickers.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    StatsTick,
    ReconnectDelay,
    Keepalive,
}

#[derive(Debug, Default)]
pub struct Timers {
    tasks: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` once after `delay`
    pub fn arm_once<F>(&mut self, kind: TimerKind, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel(kind);
        trace!("Arming {:?} in {:?}", kind, delay);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });
        self.tasks.insert(kind, handle);
    }

    /// Run `tick` every `period`, first after one full period; stops when `tick` returns false
    pub fn arm_interval<F>(&mut self, kind: TimerKind, period: Duration, mut tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.cancel(kind);
        trace!("Arming {:?} every {:?}", kind, period);
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if !tick() {
                    break;
                }
            }
        });
        self.tasks.insert(kind, handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.tasks.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn is_armed(&self, kind: TimerKind) -> bool {
        self.tasks
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
