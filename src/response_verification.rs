//! Maps AMQP delivery outcomes and error conditions to [IotHubError]s.

use crate::amqp::outcome::*;
use crate::error::IotHubError;

/// `None` means the service accepted the delivery. Anything else, including a missing or
///  non-terminal outcome, is reported as an error.
pub fn verify_delivery_outcome(outcome: Option<&DeliveryOutcome>) -> Option<IotHubError> {
    match outcome {
        Some(DeliveryOutcome::Accepted) => None,
        Some(DeliveryOutcome::Rejected(Some(condition))) => Some(error_from_condition(condition)),
        Some(DeliveryOutcome::Rejected(None)) => Some(IotHubError::Unknown("the service rejected the message without an error condition".to_string())),
        Some(other) => Some(IotHubError::Unknown(format!("unexpected delivery outcome {:?}", other.code()))),
        None => Some(IotHubError::Unknown("the service did not report a delivery outcome".to_string())),
    }
}

pub fn error_from_condition(condition: &ErrorCondition) -> IotHubError {
    let description = condition.describe();
    match condition.condition.as_str() {
        CONDITION_NOT_FOUND => IotHubError::NotFound(description),
        CONDITION_NOT_IMPLEMENTED => IotHubError::NotImplemented(description),
        CONDITION_NOT_ALLOWED => IotHubError::NotAllowed(description),
        CONDITION_UNAUTHORIZED_ACCESS => IotHubError::Unauthorized(description),
        CONDITION_RESOURCE_LIMIT_EXCEEDED => IotHubError::ResourceLimitExceeded(description),
        CONDITION_CONNECTION_FORCED | CONDITION_LINK_DETACH_FORCED => IotHubError::ConnectionClosed(description),
        _ => IotHubError::Unknown(description),
    }
}
