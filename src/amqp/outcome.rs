use std::collections::BTreeMap;
use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const CONDITION_NOT_FOUND: &str = "amqp:not-found";
pub const CONDITION_NOT_IMPLEMENTED: &str = "amqp:not-implemented";
pub const CONDITION_NOT_ALLOWED: &str = "amqp:not-allowed";
pub const CONDITION_UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
pub const CONDITION_RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
pub const CONDITION_CONNECTION_FORCED: &str = "amqp:connection:forced";
pub const CONDITION_LINK_DETACH_FORCED: &str = "amqp:link:detach-forced";
pub const CONDITION_INTERNAL_ERROR: &str = "amqp:internal-error";

/// Descriptor codes of the AMQP 1.0 delivery states, as they appear on the wire
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum DeliveryStateCode {
    Received = 0x23,
    Accepted = 0x24,
    Rejected = 0x25,
    Released = 0x26,
    Modified = 0x27,
}

/// An AMQP error: a symbolic condition plus optional description and info map
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorCondition {
    pub condition: String,
    pub description: Option<String>,
    pub info: BTreeMap<String, String>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<String>, description: Option<&str>) -> ErrorCondition {
        ErrorCondition {
            condition: condition.into(),
            description: description.map(|s| s.to_string()),
            info: BTreeMap::default(),
        }
    }

    /// the description if there is one, the condition symbol otherwise
    pub fn describe(&self) -> String {
        match &self.description {
            Some(description) => format!("{}: {}", self.condition, description),
            None => self.condition.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    Accepted,
    Released,
    Rejected(Option<ErrorCondition>),
    Received { section_number: u32, section_offset: u64 },
    Modified { delivery_failed: bool, undeliverable_here: bool },
}

impl DeliveryOutcome {
    pub fn code(&self) -> DeliveryStateCode {
        match self {
            DeliveryOutcome::Accepted => DeliveryStateCode::Accepted,
            DeliveryOutcome::Released => DeliveryStateCode::Released,
            DeliveryOutcome::Rejected(_) => DeliveryStateCode::Rejected,
            DeliveryOutcome::Received { .. } => DeliveryStateCode::Received,
            DeliveryOutcome::Modified { .. } => DeliveryStateCode::Modified,
        }
    }

    /// `Received` is the only delivery state that does not end a delivery's lifecycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryOutcome::Received { .. })
    }

    /// Builds an outcome from a raw descriptor code as a wire-level engine sees it. Fields of
    ///  `Received` and `Modified` are reset to their protocol defaults.
    pub fn from_descriptor(descriptor: u64, error: Option<ErrorCondition>) -> anyhow::Result<DeliveryOutcome> {
        let code = DeliveryStateCode::try_from(descriptor)
            .map_err(|_| anyhow!("unknown delivery state descriptor 0x{:x}", descriptor))?;

        Ok(match code {
            DeliveryStateCode::Accepted => DeliveryOutcome::Accepted,
            DeliveryStateCode::Released => DeliveryOutcome::Released,
            DeliveryStateCode::Rejected => DeliveryOutcome::Rejected(error),
            DeliveryStateCode::Received => DeliveryOutcome::Received { section_number: 0, section_offset: 0 },
            DeliveryStateCode::Modified => DeliveryOutcome::Modified { delivery_failed: false, undeliverable_here: false },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::accepted(0x24, Some(DeliveryOutcome::Accepted))]
    #[case::released(0x26, Some(DeliveryOutcome::Released))]
    #[case::rejected(0x25, Some(DeliveryOutcome::Rejected(None)))]
    #[case::modified(0x27, Some(DeliveryOutcome::Modified { delivery_failed: false, undeliverable_here: false }))]
    #[case::received(0x23, Some(DeliveryOutcome::Received { section_number: 0, section_offset: 0 }))]
    #[case::unknown(0x99, None)]
    fn test_from_descriptor(#[case] descriptor: u64, #[case] expected: Option<DeliveryOutcome>) {
        let actual = DeliveryOutcome::from_descriptor(descriptor, None).ok();
        assert_eq!(actual, expected);
        if let Some(outcome) = actual {
            assert_eq!(u64::from(outcome.code()), descriptor);
        }
    }

    #[test]
    fn test_rejected_keeps_error_condition() {
        let condition = ErrorCondition::new(CONDITION_NOT_FOUND, Some("no such device"));
        let outcome = DeliveryOutcome::from_descriptor(0x25, Some(condition.clone())).unwrap();
        assert_eq!(outcome, DeliveryOutcome::Rejected(Some(condition)));
        assert!(outcome.is_terminal());
    }

    #[rstest]
    #[case::with_description(ErrorCondition::new("amqp:not-found", Some("gone")), "amqp:not-found: gone")]
    #[case::without_description(ErrorCondition::new("amqp:not-found", None), "amqp:not-found")]
    fn test_describe(#[case] condition: ErrorCondition, #[case] expected: &str) {
        assert_eq!(condition.describe(), expected);
    }
}
