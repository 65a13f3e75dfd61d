use crate::error::{EndpointLayer, IotHubError};

/// Which layers the service has opened so far
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpenProgress {
    pub connection_opened_remotely: bool,
    pub session_opened_remotely: bool,
    pub link_opened_remotely: bool,
}

/// Diagnoses why a connection did not open: an error reported by the service wins, otherwise
///  the first layer (connection, then session, then link) that the service never opened
pub fn verify_connection_was_opened(progress: &OpenProgress, failure: Option<&IotHubError>) -> Result<(), IotHubError> {
    if let Some(failure) = failure {
        return Err(failure.clone());
    }

    let checks = [
        (progress.connection_opened_remotely, EndpointLayer::Connection),
        (progress.session_opened_remotely, EndpointLayer::Session),
        (progress.link_opened_remotely, EndpointLayer::Link),
    ];
    for (opened, layer) in checks {
        if !opened {
            return Err(IotHubError::NotOpened(layer));
        }
    }
    Ok(())
}
