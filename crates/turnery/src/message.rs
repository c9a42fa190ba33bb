use crate::error::RuntimeError;
use crate::types::RequestId;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Caller-supplied correlation metadata carried by external requests.
pub type CorrelationContext = HashMap<String, String>;

/// Channel type over which a turn's outcome is reported to its observer.
pub type CompletionSender = tokio::sync::oneshot::Sender<Result<(), RuntimeError>>;

/// One reminder firing as delivered to an entity.
#[derive(Debug, Clone)]
pub struct FiredReminder {
    pub name: String,
    /// Opaque context payload. Unused by the reference entity.
    pub context: Vec<u8>,
    pub due: Duration,
    pub period: Duration,
}

/// A logical operation to execute as one turn against an entity.
#[derive(Debug)]
pub enum Operation {
    /// External "start processing" request.
    StartProcessing { correlation: CorrelationContext },
    /// A reminder firing delivered by the pump (or directly by tests).
    Reminder { fire: FiredReminder },
}

impl Operation {
    /// Short tag for tracing.
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::StartProcessing { .. } => "start_processing",
            Operation::Reminder { .. } => "reminder",
        }
    }
}

/// One queued turn: the operation plus its observer and cancellation signal.
pub struct TurnRequest {
    pub request_id: RequestId,
    pub operation: Operation,
    /// When present and cancelled before the turn begins, the turn is
    /// abandoned. When cancelled mid-turn, the turn runs to completion and
    /// the observer sees `Cancelled` afterwards.
    pub cancellation: Option<CancellationToken>,
    pub completion: CompletionSender,
}
