//! Application facing clients. Each client owns at most one running connection, and each
//!  connection runs on its own reactor thread.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::amqp::engine::ProtocolEngine;
use crate::config::ConnectionConfig;
use crate::connection::handler::{AmqpConnectionHandler, ConnectionCallbacks};
use crate::error::IotHubError;
use crate::reactor::clock::{Clock, SystemClock};
use crate::reactor::runner::{ReactorHandle, ReactorRunner};

pub mod feedback_processor;
pub mod file_upload_processor;
pub mod messaging_client;

/// how long a stopped reactor gets to report its exit after a failed open
const EXIT_REPORT_TIMEOUT: Duration = Duration::from_secs(1);
/// how long a connection that did not open in time gets to close gracefully
const STOP_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Creates a fresh protocol engine for every connection attempt
pub trait EngineFactory: Send + Sync + 'static {
    fn create_engine(&self) -> anyhow::Result<Box<dyn ProtocolEngine>>;
}

impl<F> EngineFactory for F
where F: Fn() -> anyhow::Result<Box<dyn ProtocolEngine>> + Send + Sync + 'static
{
    fn create_engine(&self) -> anyhow::Result<Box<dyn ProtocolEngine>> {
        self()
    }
}

enum OpenSignal {
    Opened,
    Exited(Result<(), IotHubError>),
}

/// Starts and stops the reactor for one client, and turns its asynchronous open notification
///  into a blocking wait with a timeout
pub(crate) struct ClientConnection {
    name: String,
    config: Arc<ConnectionConfig>,
    engine_factory: Arc<dyn EngineFactory>,
    clock: Arc<dyn Clock>,
    runner: Option<ReactorRunner>,
}

impl ClientConnection {
    pub fn new(name: &str, config: ConnectionConfig, engine_factory: Arc<dyn EngineFactory>) -> anyhow::Result<ClientConnection> {
        config.validate()?;
        Ok(ClientConnection {
            name: name.to_string(),
            config: Arc::new(config),
            engine_factory,
            clock: Arc::new(SystemClock),
            runner: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.runner.as_ref()
            .map(|r| r.is_running())
            .unwrap_or(false)
    }

    pub fn handle(&self) -> Option<ReactorHandle> {
        self.runner.as_ref()
            .filter(|r| r.is_running())
            .map(|r| r.handle())
    }

    /// Opens the connection and waits until all of its links are open. A zero timeout waits
    ///  indefinitely.
    pub fn start(&mut self, mut callbacks: ConnectionCallbacks, timeout: Duration) -> Result<(), IotHubError> {
        if self.is_running() {
            return Err(IotHubError::NotAllowed(format!("{} is already running", self.name)));
        }
        if let Some(mut stale) = self.runner.take() {
            stale.stop(Duration::ZERO);
        }

        let (signal_send, signal_recv) = mpsc::channel();
        let opened_send = Mutex::new(signal_send.clone());
        let application_on_opened = callbacks.on_opened.take();
        callbacks.on_opened = Some(Arc::new(move || {
            if let Ok(send) = opened_send.lock() {
                let _ = send.send(OpenSignal::Opened);
            }
            if let Some(on_opened) = &application_on_opened {
                on_opened();
            }
        }));

        let handler = AmqpConnectionHandler::new(self.config.clone(), callbacks)
            .map_err(|e| IotHubError::NotAllowed(format!("{:#}", e)))?;
        let engine = self.engine_factory.create_engine()
            .map_err(|e| IotHubError::Transport(format!("failed to create protocol engine: {:#}", e)))?;

        info!("starting {}", self.name);
        let mut runner = ReactorRunner::start(&self.name, engine, handler, self.clock.clone(), self.config.reactor_poll_timeout, Box::new(move |result| {
            let _ = signal_send.send(OpenSignal::Exited(result));
        }))
            .map_err(|e| IotHubError::Transport(format!("failed to start reactor: {:#}", e)))?;

        let signal = if timeout.is_zero() {
            signal_recv.recv().ok()
        }
        else {
            match signal_recv.recv_timeout(timeout) {
                Ok(signal) => Some(signal),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!("{} did not open within {:?}", self.name, timeout);
                    runner.stop(STOP_GRACE_PERIOD);
                    signal_recv.recv_timeout(EXIT_REPORT_TIMEOUT).ok()
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => None,
            }
        };

        match signal {
            Some(OpenSignal::Opened) => {
                debug!("{} is open", self.name);
                self.runner = Some(runner);
                Ok(())
            }
            Some(OpenSignal::Exited(result)) => {
                runner.stop(Duration::ZERO);
                Err(result.err().unwrap_or_else(|| IotHubError::ConnectionClosed("the connection closed while opening".to_string())))
            }
            None => {
                runner.stop(Duration::ZERO);
                Err(IotHubError::Transport(format!("{} did not open", self.name)))
            }
        }
    }

    /// Closes the connection gracefully, forcibly after `timeout`. Returns `true` if the close
    ///  was graceful.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        match self.runner.take() {
            Some(mut runner) => {
                info!("stopping {}", self.name);
                runner.stop(timeout)
            }
            None => true,
        }
    }
}
