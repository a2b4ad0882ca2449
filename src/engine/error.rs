use ulid::Ulid;

use crate::model::SlotStatus;

/// A single field-level validation failure. Validators collect these so a
/// caller sees every bad field at once, not just the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input; nothing was touched.
    Validation(Vec<FieldError>),
    /// Candidate slot interval intersects existing slots in the same
    /// (provider, service, date) scope.
    SlotOverlap { conflicting: Vec<Ulid> },
    /// Candidate config date range intersects active configs in the same
    /// (provider, service, type) scope.
    ConfigOverlap { conflicting: Vec<Ulid> },
    /// Lost capacity-claim race or full slot. Retryable by the caller.
    CapacityExhausted { slot_id: Ulid },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Requested status change is not in the lifecycle state machine.
    InvalidTransition { from: SlotStatus, to: SlotStatus },
    /// Claim attempted against a blocked or cancelled slot.
    SlotNotClaimable { slot_id: Ulid, status: SlotStatus },
    /// Delete or cancel attempted while bookings are held.
    SlotHasBookings { slot_id: Ulid, booked: u32 },
    /// Generation attempted from a deactivated config.
    ConfigInactive(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Wrap validator output, or Ok if the validator found nothing.
    pub fn check(errors: Vec<FieldError>) -> Result<(), EngineError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(errors))
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(errors) => {
                write!(f, "validation failed:")?;
                for e in errors {
                    write!(f, " [{}: {}]", e.field, e.message)?;
                }
                Ok(())
            }
            EngineError::SlotOverlap { conflicting } => {
                write!(f, "slot overlaps existing slots: {conflicting:?}")
            }
            EngineError::ConfigOverlap { conflicting } => {
                write!(f, "config date range overlaps active configs: {conflicting:?}")
            }
            EngineError::CapacityExhausted { slot_id } => {
                write!(f, "slot {slot_id} has no remaining capacity")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::SlotNotClaimable { slot_id, status } => {
                write!(f, "slot {slot_id} is {status} and cannot be claimed")
            }
            EngineError::SlotHasBookings { slot_id, booked } => {
                write!(f, "slot {slot_id} still holds {booked} booking(s)")
            }
            EngineError::ConfigInactive(id) => write!(f, "config {id} is deactivated"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
