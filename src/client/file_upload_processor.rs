use std::sync::Arc;
use std::time::Duration;
use crate::client::{ClientConnection, EngineFactory};
use crate::config::{ApplicationLinkKind, ConnectionConfig};
use crate::connection::handler::ConnectionCallbacks;
use crate::error::{ErrorProcessor, IotHubError};
use crate::link::receiver::MessageProcessor;
use crate::session::application_session::ApplicationProcessors;

/// Receives the notifications the service emits when a device completed a file upload
pub struct FileUploadNotificationProcessorClient {
    connection: ClientConnection,
    processor: MessageProcessor,
    error_processor: Option<ErrorProcessor>,
}

impl FileUploadNotificationProcessorClient {
    pub fn new(mut config: ConnectionConfig, engine_factory: Arc<dyn EngineFactory>, processor: MessageProcessor) -> anyhow::Result<FileUploadNotificationProcessorClient> {
        config.application_links = vec![ApplicationLinkKind::FileUploadNotificationReceiver];
        Ok(FileUploadNotificationProcessorClient {
            connection: ClientConnection::new("file-upload-notification-processor", config, engine_factory)?,
            processor,
            error_processor: None,
        })
    }

    pub fn with_error_processor(mut self, error_processor: ErrorProcessor) -> FileUploadNotificationProcessorClient {
        self.error_processor = Some(error_processor);
        self
    }

    pub fn start(&mut self, timeout: Duration) -> Result<(), IotHubError> {
        let callbacks = ConnectionCallbacks {
            processors: ApplicationProcessors {
                feedback: None,
                file_upload_notification: Some(self.processor.clone()),
            },
            error_processor: self.error_processor.clone(),
            on_opened: None,
        };
        self.connection.start(callbacks, timeout)
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.connection.stop(timeout)
    }

    pub fn is_running(&self) -> bool {
        self.connection.is_running()
    }
}
