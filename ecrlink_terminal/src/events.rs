//! The observable surface of the coordinator.
//!
//! Every outcome reaches the embedder as exactly one typed [Event] on the
//! manager's event stream. Delivery may happen on the reader task;
//! embedders driving a UI marshal to their UI thread themselves.

use crate::session::{BonusInfo, SessionKind, SessionState};
use chrono::{DateTime, Utc};
use ecrlink::packets::{DeviceStatus, TransactionResult, TransactionStatus};
use serde::Serialize;

/// A user-visible prompt derived from a status message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPrompt {
    /// The result code that raised the prompt; [ecrlink::constants::RETRY_TRANSACTION_CODE]
    /// for synthetic retry prompts.
    pub result_code: String,
    pub info: String,
}

/// A completed transaction enriched with session context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOutcome {
    pub session_id: Option<String>,
    pub kind: Option<SessionKind>,
    pub result: TransactionResult,
    pub bonus: Option<BonusInfo>,
}

/// Errors surfaced on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ErrorEvent {
    /// Port unavailable, I/O failure or reader exit; the engine was torn
    /// down and reopens lazily on the next operation.
    Communication { message: String },
    /// All send attempts exhausted without ACK/NAK/STX.
    Timeout { attempts: u32, message: String },
    /// An operation was refused because another session claims the
    /// terminal.
    SessionConflict {
        session_id: String,
        kind: SessionKind,
        state: SessionState,
        transaction_id: String,
        created_at: DateTime<Utc>,
    },
    /// Bad amount or malformed transaction id; nothing went on the wire.
    Validation { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    /// The terminal acknowledged a command frame.
    CommandAccepted { command: String },
    /// Every status message, in wire order, handled or not.
    StatusChanged(TransactionStatus),
    /// The terminal assigned a transaction id to the active session.
    TransactionInitialized { transaction_id: String },
    /// The terminal gave up on the transaction.
    TerminalAbort {
        phase: char,
        result_code: String,
        info: String,
    },
    /// Answer to an abort-transaction command.
    AbortResult { aborted: bool, message: String },
    /// A prompt was routed through the policy.
    UserPrompt(UserPrompt),
    Purchase(TransactionOutcome),
    Refund(TransactionOutcome),
    Reversal(TransactionOutcome),
    Retrieve(TransactionOutcome),
    /// A result arrived with no session to attribute it to.
    Result(TransactionOutcome),
    /// Bonus-card data became available.
    Bonus(BonusInfo),
    DeviceStatus(DeviceStatus),
    Wakeup,
    Error(ErrorEvent),
}
