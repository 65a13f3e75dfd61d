use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::error;
use crate::amqp::engine::ProtocolEngine;
use crate::reactor::clock::Clock;
use crate::reactor::timer::{TimerQueue, TimerTask};

pub mod clock;
pub mod runner;
pub mod timer;

/// What every handler gets while it processes an event: the engine to issue commands to, the
///  timer queue to schedule follow-up work on, and the clock.
pub struct ReactorContext<'a> {
    pub engine: &'a mut dyn ProtocolEngine,
    pub timers: &'a mut TimerQueue,
    pub clock: &'a dyn Clock,
}

impl ReactorContext<'_> {
    pub fn schedule(&mut self, delay: Duration, task: TimerTask) {
        let now = self.clock.now();
        self.timers.schedule(now, delay, task);
    }
}

/// Runs application code on the reactor thread. A panic must not take the connection's event
///  loop down with it, so it is logged and swallowed.
pub(crate) fn invoke_application_callback<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(_) => {
            error!("application callback '{}' panicked - ignoring", what);
            None
        }
    }
}
