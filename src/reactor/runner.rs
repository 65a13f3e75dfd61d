use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc as command_channel;
use tracing::{debug, error, info, trace, warn};
use crate::amqp::engine::ProtocolEngine;
use crate::amqp::event::Event;
use crate::amqp::outcome::{ErrorCondition, CONDITION_INTERNAL_ERROR};
use crate::connection::handler::AmqpConnectionHandler;
use crate::error::IotHubError;
use crate::link::cloud_to_device::PendingSend;
use crate::reactor::clock::Clock;
use crate::reactor::timer::TimerQueue;
use crate::reactor::ReactorContext;

/// Requests from application threads. They are the only way in: all connection state is owned
///  by the reactor thread.
pub enum ReactorCommand {
    Send(PendingSend),
    Close,
}

/// Called once on the reactor thread after the loop ends, with the diagnosis of whether the
///  connection was ever fully opened
pub type ExitCallback = Box<dyn FnOnce(Result<(), IotHubError>) + Send>;

#[derive(Clone)]
pub struct ReactorHandle {
    commands: command_channel::UnboundedSender<ReactorCommand>,
}

impl ReactorHandle {
    /// Hands a message to the reactor. If the reactor is gone, the message's callback is invoked
    ///  right away with a connection closed error.
    pub fn send(&self, pending: PendingSend) {
        if let Err(e) = self.commands.send(ReactorCommand::Send(pending)) {
            if let ReactorCommand::Send(pending) = e.0 {
                pending.fail(IotHubError::ConnectionClosed("the connection is not running".to_string()));
            }
        }
    }

    /// Asks the reactor to close the connection gracefully. Returns `false` if the reactor is
    ///  not running anymore.
    pub fn close(&self) -> bool {
        self.commands.send(ReactorCommand::Close).is_ok()
    }
}

enum Step {
    Command(Option<ReactorCommand>),
    Events(anyhow::Result<Vec<Event>>),
}

/// Owns the thread that runs one connection's event loop
pub struct ReactorRunner {
    name: String,
    handle: ReactorHandle,
    force_stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl ReactorRunner {
    pub fn start(name: &str, engine: Box<dyn ProtocolEngine>, handler: AmqpConnectionHandler, clock: Arc<dyn Clock>, poll_timeout: Duration, on_exit: ExitCallback) -> anyhow::Result<ReactorRunner> {
        let (commands_send, commands_recv) = command_channel::unbounded_channel();
        let (done_send, done_recv) = mpsc::channel();
        let force_stop = Arc::new(AtomicBool::new(false));

        let thread_force_stop = force_stop.clone();
        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(rt) => rt.block_on(run_reactor(engine, handler, clock, poll_timeout, commands_recv, thread_force_stop)),
                    Err(e) => {
                        error!("reactor {}: failed to create runtime: {}", thread_name, e);
                        Err(IotHubError::Transport(format!("failed to create runtime: {}", e)))
                    }
                };
                info!("reactor {} stopped", thread_name);
                on_exit(result);
                let _ = done_send.send(());
            })?;

        Ok(ReactorRunner {
            name: name.to_string(),
            handle: ReactorHandle { commands: commands_send },
            force_stop,
            done: done_recv,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Closes the connection and waits for the reactor to finish. If it does not finish within
    ///  `timeout`, it is stopped forcibly. A zero timeout waits indefinitely.
    ///
    /// Returns `true` if the reactor finished gracefully.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return true,
        };

        self.handle.close();
        let graceful = if timeout.is_zero() {
            // a disconnected channel means the thread is gone as well
            let _ = self.done.recv();
            true
        }
        else {
            !matches!(self.done.recv_timeout(timeout), Err(mpsc::RecvTimeoutError::Timeout))
        };

        if !graceful {
            warn!("reactor {} did not stop within {:?} - stopping it forcibly", self.name, timeout);
            self.force_stop.store(true, Ordering::Release);
        }
        if thread.join().is_err() {
            error!("reactor {} panicked", self.name);
        }
        graceful
    }
}

impl Drop for ReactorRunner {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("reactor {} dropped while running - stopping it", self.name);
            self.force_stop.store(true, Ordering::Release);
            self.handle.close();
        }
    }
}

async fn run_reactor(
    mut engine: Box<dyn ProtocolEngine>,
    mut handler: AmqpConnectionHandler,
    clock: Arc<dyn Clock>,
    poll_timeout: Duration,
    mut commands: command_channel::UnboundedReceiver<ReactorCommand>,
    force_stop: Arc<AtomicBool>,
) -> Result<(), IotHubError> {
    let mut timers = TimerQueue::new();
    {
        let mut ctx = ReactorContext { engine: engine.as_mut(), timers: &mut timers, clock: clock.as_ref() };
        if let Err(e) = handler.open(&mut ctx) {
            error!("failed to open connection: {:#}", e);
        }
    }

    let mut commands_closed = false;
    while !handler.is_finished() {
        if force_stop.load(Ordering::Acquire) {
            warn!("reactor stopped forcibly");
            break;
        }

        let poll_timeout = match timers.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(clock.now()).min(poll_timeout),
            None => poll_timeout,
        };

        let step = select! {
            command = commands.recv(), if !commands_closed => Step::Command(command),
            events = engine.poll_events(poll_timeout) => Step::Events(events),
        };

        let mut ctx = ReactorContext { engine: engine.as_mut(), timers: &mut timers, clock: clock.as_ref() };
        match step {
            Step::Command(Some(ReactorCommand::Send(pending))) => handler.enqueue(pending),
            Step::Command(Some(ReactorCommand::Close)) => handler.close(&mut ctx),
            Step::Command(None) => {
                debug!("all reactor handles were dropped - closing");
                commands_closed = true;
                handler.close(&mut ctx);
            }
            Step::Events(Ok(events)) => {
                for event in events {
                    handler.on_event(&mut ctx, event);
                }
            }
            Step::Events(Err(e)) => {
                error!("protocol engine failed: {:#}", e);
                let description = format!("{:#}", e);
                handler.on_event(&mut ctx, Event::TransportError(ErrorCondition::new(CONDITION_INTERNAL_ERROR, Some(&description))));
                handler.on_event(&mut ctx, Event::TransportClosed);
            }
        }

        let now = ctx.clock.now();
        for task in ctx.timers.pop_due(now) {
            trace!("timer {:?} is due", task);
            handler.on_timer(&mut ctx, task);
        }
    }
    handler.abort();

    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let ReactorCommand::Send(pending) = command {
            pending.fail(IotHubError::ConnectionClosed("the connection was closed before the message was sent".to_string()));
        }
    }
    handler.verify_connection_was_opened()
}
