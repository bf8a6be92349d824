//! The session ledger: one entry per caller-initiated terminal interaction.

use chrono::{DateTime, Utc};
use ecrlink::constants::PLACEHOLDER_TRANSACTION_ID;
use ecrlink::packets::TransactionStatus;
use serde::Serialize;
use std::collections::VecDeque;

/// Capacity of the ledger; the oldest session is dropped first.
pub const LEDGER_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionKind {
    Payment,
    Refund,
    Reversal,
    Retrieve,
}

impl SessionKind {
    /// The command name used for notifications and logging.
    pub fn command(self) -> &'static str {
        match self {
            Self::Payment => "Payment",
            Self::Refund => "Refund",
            Self::Reversal => "Reversal",
            Self::Retrieve => "Retrieve",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Running,
    Completed,
    BonusDetectedAndHalted,
    TerminalAborted,
    Aborted,
    Error,
}

impl SessionState {
    /// States that refuse a new session-initiating operation.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Running | Self::BonusDetectedAndHalted
        )
    }

    /// Terminal states; a session in one of these is immutable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Aborted | Self::TerminalAborted | Self::Error
        )
    }
}

/// Bonus-card data collected for a payment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BonusInfo {
    pub customer_number: String,
    pub member_class: String,
    pub status_code: String,
    pub status_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    /// Minor currency units; zero for Reversal/Retrieve.
    pub amount: u64,
    pub transaction_id: String,
    /// `yyMMddHHmmss` of the original transaction (Reversal/Retrieve).
    pub original_timestamp: Option<String>,
    /// This payment is the continuation of a bonus-halted one.
    pub bonus_handled: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_status: Option<TransactionStatus>,
    pub error: Option<String>,
    /// Payment only.
    pub bonus: Option<BonusInfo>,
    /// Payment only.
    pub manual_auth_code: Option<String>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Session {
    pub fn new(id: String, kind: SessionKind, amount: u64) -> Self {
        Self {
            id,
            kind,
            state: SessionState::Created,
            amount,
            transaction_id: PLACEHOLDER_TRANSACTION_ID.to_string(),
            original_timestamp: None,
            bonus_handled: false,
            created_at: Utc::now(),
            completed_at: None,
            last_status: None,
            error: None,
            bonus: None,
            manual_auth_code: None,
        }
    }

    /// Moves to `state` unless this session is already in a terminal state.
    pub fn transition(&mut self, state: SessionState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        if state.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Closes the session with an error.
    pub fn fail(&mut self, message: String) {
        if self.transition(SessionState::Error) {
            self.error = Some(message);
        }
    }

    /// The terminal has not assigned a transaction id yet.
    pub fn has_placeholder_id(&self) -> bool {
        self.transaction_id == PLACEHOLDER_TRANSACTION_ID
    }
}

/// Bounded, ordered session history. Equality is by session id; insertion
/// of a known id replaces the entry in place.
#[derive(Debug, Default)]
pub struct SessionLedger {
    sessions: VecDeque<Session>,
}

impl SessionLedger {
    pub fn insert(&mut self, session: Session) {
        if let Some(existing) = self.get_mut(&session.id) {
            *existing = session;
            return;
        }
        if self.sessions.len() == LEDGER_CAPACITY {
            self.sessions.pop_front();
        }
        self.sessions.push_back(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// The newest session still claiming the terminal.
    pub fn active(&self) -> Option<&Session> {
        self.sessions.iter().rev().find(|s| s.state.is_active())
    }

    pub fn active_mut(&mut self) -> Option<&mut Session> {
        self.sessions.iter_mut().rev().find(|s| s.state.is_active())
    }

    /// The newest running session.
    pub fn last_running(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .rev()
            .find(|s| s.state == SessionState::Running)
    }

    /// The bonus info a completing continuation payment inherits: the entry
    /// immediately preceding `id` must be a bonus-halted payment.
    pub fn inherited_bonus(&self, id: &str) -> Option<BonusInfo> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        let session = &self.sessions[index];
        if session.kind != SessionKind::Payment || !session.bonus_handled {
            return None;
        }
        let predecessor = &self.sessions[index.checked_sub(1)?];
        if predecessor.kind == SessionKind::Payment
            && predecessor.state == SessionState::BonusDetectedAndHalted
        {
            return predecessor.bonus.clone();
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        Session::new(id.to_string(), SessionKind::Payment, 1000)
    }

    #[test]
    fn test_ledger_is_bounded() {
        let mut ledger = SessionLedger::default();
        for i in 0..LEDGER_CAPACITY + 10 {
            ledger.insert(session(&format!("{i}")));
        }
        assert_eq!(ledger.len(), LEDGER_CAPACITY);
        // The oldest sessions were dropped first.
        assert!(ledger.get("9").is_none());
        assert!(ledger.get("10").is_some());
    }

    #[test]
    fn test_insert_replaces_by_id() {
        let mut ledger = SessionLedger::default();
        ledger.insert(session("a"));
        let mut replacement = session("a");
        replacement.amount = 42;
        ledger.insert(replacement);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("a").unwrap().amount, 42);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut s = session("a");
        assert!(s.transition(SessionState::Running));
        assert!(s.transition(SessionState::Completed));
        assert!(s.completed_at.is_some());
        assert!(!s.transition(SessionState::Running));
        assert_eq!(s.state, SessionState::Completed);

        let mut s = session("b");
        s.fail("boom".to_string());
        assert_eq!(s.state, SessionState::Error);
        s.fail("again".to_string());
        assert_eq!(s.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_active_lookup() {
        let mut ledger = SessionLedger::default();
        let mut done = session("done");
        done.transition(SessionState::Completed);
        ledger.insert(done);
        assert!(ledger.active().is_none());

        ledger.insert(session("running"));
        ledger.get_mut("running").unwrap().state = SessionState::Running;
        assert_eq!(ledger.active().unwrap().id, "running");
        assert_eq!(ledger.last_running().unwrap().id, "running");
    }

    #[test]
    fn test_inherited_bonus() {
        let mut ledger = SessionLedger::default();
        let mut halted = session("first");
        halted.state = SessionState::BonusDetectedAndHalted;
        halted.bonus = Some(BonusInfo {
            customer_number: "9912345678".to_string(),
            member_class: "02".to_string(),
            status_code: "2001".to_string(),
            status_text: String::new(),
        });
        ledger.insert(halted);

        let mut continuation = session("second");
        continuation.bonus_handled = true;
        ledger.insert(continuation);

        let bonus = ledger.inherited_bonus("second").unwrap();
        assert_eq!(bonus.customer_number, "9912345678");

        // A plain payment inherits nothing.
        assert!(ledger.inherited_bonus("first").is_none());
    }
}
