//! The session coordinator.
//!
//! [TerminalManager] owns the protocol engine, correlates asynchronous
//! terminal events to the caller-initiated session, routes user prompts
//! through the [PromptPolicy] and publishes typed [Event]s. All public
//! operations are non-blocking and must be invoked inside a tokio runtime;
//! outcomes arrive on the event stream.

use crate::config::TerminalConfig;
use crate::events::{ErrorEvent, Event, TransactionOutcome, UserPrompt};
use crate::policy::PromptPolicy;
use crate::records::{RecordStore, TransactionRecord};
use crate::session::{BonusInfo, Session, SessionKind, SessionLedger, SessionState};
use chrono::Utc;
use ecrlink::constants::{PHASE_INITIALIZED, PLACEHOLDER_TRANSACTION_ID, RETRY_TRANSACTION_CODE, STATUS_ACCEPT_OR_REJECT};
use ecrlink::packets::{
    AbortTransaction, AbortTransactionResult, AcceptOrReject, AuxiliaryMode, BonusCardMode,
    CustomerRequest, CustomerRequestResult, DeviceQuery, DisplayOption, DisplayText,
    ManualEntryKind, Message, StatusClass, TransactionRequest, TransactionStatus,
    TransactionType, VerifySignature,
};
use ecrlink::port::open_serial;
use ecrlink::{BytePort, LinkError, LinkEvent, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("{0}")]
    Validation(String),
}

/// The modules just to use the mocking. Really cumbersome...
mod outer {
    use super::*;

    #[cfg_attr(test, mockall::automock)]
    pub(super) mod inner {
        use super::*;

        /// Opens the serial device named in the config.
        ///
        /// We mock this function in the test configuration.
        #[cfg_attr(test, allow(dead_code))]
        pub fn open_port(
            config: &TerminalConfig,
        ) -> std::io::Result<(Box<dyn BytePort>, Box<dyn BytePort>)> {
            let (reader, writer) = open_serial(&config.port, &config.serial)?;
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

#[mockall_double::double]
use outer::inner;

/// Parameters of the last payment, kept for policy-driven reruns.
#[derive(Debug, Clone)]
struct PaymentParams {
    amount: u64,
    bonus_handled: bool,
}

/// Everything needed to start a session-initiating transaction.
struct TransactionPlan {
    kind: SessionKind,
    amount: u64,
    transaction_id: Option<String>,
    original_timestamp: Option<String>,
    bonus_handled: bool,
    session_id: Option<String>,
    /// Internal restarts bypass the session-conflict guard.
    guarded: bool,
}

pub struct TerminalManager {
    config: TerminalConfig,
    policy: Arc<dyn PromptPolicy>,
    store: Option<Arc<dyn RecordStore>>,
    /// Guards lazy (re)construction and teardown of the engine.
    link: tokio::sync::Mutex<Option<Arc<Transport>>>,
    sessions: Mutex<SessionLedger>,
    last_payment: Mutex<Option<PaymentParams>>,
    session_seq: AtomicU64,
    events_tx: UnboundedSender<Event>,
    events_rx: Mutex<Option<UnboundedReceiver<Event>>>,
}

impl TerminalManager {
    /// Opens the terminal link eagerly; an unknown or busy serial device
    /// fails here. After a later teardown the link reopens lazily on the
    /// next operation.
    pub async fn new(
        config: TerminalConfig,
        policy: Arc<dyn PromptPolicy>,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Result<Arc<Self>, Error> {
        let (events_tx, events_rx) = unbounded_channel();
        let this = Arc::new(Self {
            config,
            policy,
            store,
            link: tokio::sync::Mutex::new(None),
            sessions: Mutex::new(SessionLedger::default()),
            last_payment: Mutex::new(None),
            session_seq: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        this.ensure_link().await?;
        Ok(this)
    }

    /// The event stream; can be taken once. Subscribe before initiating
    /// operations.
    pub fn events(&self) -> Option<UnboundedReceiverStream<Event>> {
        self.events_rx
            .lock()
            .expect("events mutex poisoned")
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// A snapshot of the session ledger, newest last.
    pub fn sessions(&self) -> Vec<Session> {
        self.lock_sessions().iter().cloned().collect()
    }

    // ---------------------------------------------------------------------
    // Public operations. All of them return immediately; outcomes are
    // delivered as events.
    // ---------------------------------------------------------------------

    /// ENQ handshake; answered with [Event::CommandAccepted] `"Test"`.
    pub fn test_terminal(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.ensure_link().await {
                Err(error) => this.emit_error(&error),
                Ok(transport) => match transport.send_handshake("Test").await {
                    Ok(()) => this.emit(Event::CommandAccepted {
                        command: "Test".to_string(),
                    }),
                    Err(error) => this.emit_error(&error.into()),
                },
            }
        });
    }

    /// Asks the terminal to abort whatever transaction is running. The
    /// outcome arrives as [Event::AbortResult].
    pub fn abort_transaction(self: &Arc<Self>) {
        self.dispatch_command(AbortTransaction.encode(), "Abort");
    }

    /// Starts a payment over `amount` minor units.
    pub fn run_payment(self: &Arc<Self>, amount: u64, bonus_handled: bool, session_id: Option<String>) {
        if amount == 0 {
            self.emit(Event::Error(ErrorEvent::Validation {
                message: "payment amount must be positive".to_string(),
            }));
            return;
        }
        self.start_transaction(TransactionPlan {
            kind: SessionKind::Payment,
            amount,
            transaction_id: None,
            original_timestamp: None,
            bonus_handled,
            session_id,
            guarded: true,
        });
    }

    pub fn refund(self: &Arc<Self>, amount: u64, session_id: Option<String>) {
        self.start_transaction(TransactionPlan {
            kind: SessionKind::Refund,
            amount,
            transaction_id: None,
            original_timestamp: None,
            bonus_handled: false,
            session_id,
            guarded: true,
        });
    }

    /// Reverses the transaction identified by its id and original
    /// `yyMMddHHmmss` timestamp, both used verbatim on the wire.
    pub fn reversal(
        self: &Arc<Self>,
        transaction_id: &str,
        original_timestamp: &str,
        session_id: Option<String>,
    ) {
        self.start_transaction(TransactionPlan {
            kind: SessionKind::Reversal,
            amount: 0,
            transaction_id: Some(transaction_id.to_string()),
            original_timestamp: Some(original_timestamp.to_string()),
            bonus_handled: false,
            session_id,
            guarded: true,
        });
    }

    pub fn retrieve_transaction(self: &Arc<Self>, transaction_id: &str, original_timestamp: &str) {
        self.start_transaction(TransactionPlan {
            kind: SessionKind::Retrieve,
            amount: 0,
            transaction_id: Some(transaction_id.to_string()),
            original_timestamp: Some(original_timestamp.to_string()),
            bonus_handled: false,
            session_id: None,
            guarded: true,
        });
    }

    pub fn retrieve_last_transaction(self: &Arc<Self>) {
        self.retrieve_transaction(PLACEHOLDER_TRANSACTION_ID, "");
    }

    pub fn retrieve_tcs_message(self: &Arc<Self>) {
        self.dispatch_command(DeviceQuery::TcsMessage.encode(), "TcsMessage");
    }

    pub fn request_terminal_status(self: &Arc<Self>) {
        self.dispatch_command(DeviceQuery::Status.encode(), "TerminalStatus");
    }

    pub fn request_terminal_version(self: &Arc<Self>) {
        self.dispatch_command(DeviceQuery::Version.encode(), "TerminalVersion");
    }

    pub fn enable_bonus_card_mode(self: &Arc<Self>, auto_reply: bool) {
        let mode = if auto_reply {
            BonusCardMode::EnableAutoReply
        } else {
            BonusCardMode::Enable
        };
        self.dispatch_command(mode.encode(), "BonusCardMode");
    }

    pub fn disable_bonus_card_mode(self: &Arc<Self>) {
        self.dispatch_command(BonusCardMode::Disable.encode(), "BonusCardMode");
    }

    /// Asks for the bonus-card data of the presented card. `stop_active`
    /// requests the terminal to leave the customer-request mode afterwards;
    /// some firmwares ignore it.
    pub fn request_bonus_card_info(self: &Arc<Self>, stop_active: bool) {
        self.dispatch_command(
            CustomerRequest {
                keep_active: !stop_active,
            }
            .encode(),
            "CustomerRequest",
        );
    }

    pub fn display_text(self: &Arc<Self>, line1: &str, line2: &str, big_font: bool) {
        let option = if big_font {
            DisplayOption::BigFont
        } else {
            DisplayOption::SmallFont
        };
        self.dispatch_command(
            DisplayText {
                line1: line1.to_string(),
                line2: line2.to_string(),
                option,
            }
            .encode(),
            "DisplayText",
        );
    }

    pub fn clear_display_text(self: &Arc<Self>) {
        self.dispatch_command(
            DisplayText {
                line1: String::new(),
                line2: String::new(),
                option: DisplayOption::Clear,
            }
            .encode(),
            "ClearDisplay",
        );
    }

    pub fn enable_auxiliary_mode(self: &Arc<Self>) {
        self.dispatch_command(AuxiliaryMode { enable: true }.encode(), "AuxiliaryMode");
    }

    pub fn disable_auxiliary_mode(self: &Arc<Self>) {
        self.dispatch_command(AuxiliaryMode { enable: false }.encode(), "AuxiliaryMode");
    }

    pub fn accept_transaction(self: &Arc<Self>, transaction_id: &str) {
        self.accept_or_reject(transaction_id, true);
    }

    pub fn reject_transaction(self: &Arc<Self>, transaction_id: &str) {
        self.accept_or_reject(transaction_id, false);
    }

    /// Tears the engine down: the reader is joined and the port released.
    /// The next operation reopens the link.
    pub async fn disconnect(&self) {
        let transport = self.link.lock().await.take();
        if let Some(transport) = transport {
            log::info!("disconnecting terminal link");
            transport.close();
        }
    }

    // ---------------------------------------------------------------------
    // Engine lifecycle.
    // ---------------------------------------------------------------------

    async fn ensure_link(self: &Arc<Self>) -> Result<Arc<Transport>, Error> {
        let mut guard = self.link.lock().await;
        if let Some(transport) = guard.as_ref() {
            if transport.is_open() {
                return Ok(Arc::clone(transport));
            }
        }
        if let Some(stale) = guard.take() {
            stale.close();
        }
        log::info!("opening terminal link on {}", self.config.port);
        let (reader_port, writer_port) =
            inner::open_port(&self.config).map_err(|e| Error::Link(e.into()))?;
        let (transport, events) =
            Transport::open(reader_port, writer_port, self.config.timing.clone());
        let transport = Arc::new(transport);
        tokio::spawn(Arc::clone(self).pump(Arc::clone(&transport), events));
        *guard = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Drains the reader's channel for the lifetime of one engine.
    async fn pump(self: Arc<Self>, transport: Arc<Transport>, mut events: UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Message(message) => self.handle_message(message).await,
                LinkEvent::Closed { error } => {
                    self.handle_link_closed(&transport, error).await;
                    break;
                }
            }
        }
    }

    async fn handle_link_closed(
        self: &Arc<Self>,
        transport: &Arc<Transport>,
        error: Option<std::io::Error>,
    ) {
        {
            let mut guard = self.link.lock().await;
            // Only release the engine this reader belonged to; a newer one
            // may already be in place.
            if guard
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, transport))
            {
                if let Some(current) = guard.take() {
                    current.close();
                }
            }
        }
        if let Some(error) = error {
            let message = error.to_string();
            if let Some(session) = self.lock_sessions().active_mut() {
                session.fail(message.clone());
            }
            self.emit(Event::Error(ErrorEvent::Communication { message }));
        }
    }

    // ---------------------------------------------------------------------
    // Sending.
    // ---------------------------------------------------------------------

    /// Fire-and-forget framed send; failures surface on the event channel.
    fn dispatch_command(self: &Arc<Self>, payload: Vec<u8>, command: &'static str) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.send_framed(payload, command).await;
        });
    }

    async fn send_framed(
        self: &Arc<Self>,
        payload: Vec<u8>,
        command: &'static str,
    ) -> Result<(), Error> {
        let transport = match self.ensure_link().await {
            Ok(transport) => transport,
            Err(error) => {
                self.emit_error(&error);
                return Err(error);
            }
        };
        match transport.send(&payload, command).await {
            Ok(()) => {
                self.emit(Event::CommandAccepted {
                    command: command.to_string(),
                });
                Ok(())
            }
            Err(error) => {
                let error = Error::from(error);
                self.emit_error(&error);
                Err(error)
            }
        }
    }

    fn accept_or_reject(self: &Arc<Self>, transaction_id: &str, accept: bool) {
        if transaction_id.len() != 5 || !transaction_id.bytes().all(|b| b.is_ascii_digit()) {
            self.emit(Event::Error(ErrorEvent::Validation {
                message: format!("transaction id must be 5 digits, got {transaction_id:?}"),
            }));
            return;
        }
        let message = AcceptOrReject {
            transaction_id: transaction_id.to_string(),
            accept,
        };
        let command = if accept {
            "AcceptTransaction"
        } else {
            "RejectTransaction"
        };
        self.dispatch_command(message.encode(), command);
    }

    fn start_transaction(self: &Arc<Self>, plan: TransactionPlan) {
        let mut conflict = None;
        let session_id = {
            let mut sessions = self.lock_sessions();
            if plan.guarded {
                if let Some(active) = sessions.active() {
                    conflict = Some(ErrorEvent::SessionConflict {
                        session_id: active.id.clone(),
                        kind: active.kind,
                        state: active.state,
                        transaction_id: active.transaction_id.clone(),
                        created_at: active.created_at,
                    });
                }
            }
            if conflict.is_some() {
                None
            } else {
                let id = plan
                    .session_id
                    .clone()
                    .unwrap_or_else(|| self.next_session_id());
                let mut session = Session::new(id.clone(), plan.kind, plan.amount);
                if let Some(transaction_id) = &plan.transaction_id {
                    session.transaction_id = transaction_id.clone();
                }
                session.original_timestamp = plan.original_timestamp.clone();
                session.bonus_handled = plan.bonus_handled;
                sessions.insert(session);
                Some(id)
            }
        };
        if let Some(conflict) = conflict {
            log::warn!("refusing {}: another session is active", plan.kind.command());
            self.emit(Event::Error(conflict));
            return;
        }
        let Some(session_id) = session_id else {
            return;
        };

        if plan.kind == SessionKind::Payment {
            *self.last_payment.lock().expect("last payment poisoned") = Some(PaymentParams {
                amount: plan.amount,
                bonus_handled: plan.bonus_handled,
            });
        }

        let request = self.transaction_request(
            plan.kind,
            plan.amount,
            plan.transaction_id
                .unwrap_or_else(|| PLACEHOLDER_TRANSACTION_ID.to_string()),
            plan.original_timestamp,
            plan.bonus_handled,
            None,
        );
        let command = plan.kind.command();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.send_framed(request.encode(), command).await {
                Ok(()) => {
                    if let Some(session) = this.lock_sessions().get_mut(&session_id) {
                        session.transition(SessionState::Running);
                    }
                }
                Err(error) => {
                    if let Some(session) = this.lock_sessions().get_mut(&session_id) {
                        session.fail(error.to_string());
                    }
                }
            }
        });
    }

    fn transaction_request(
        &self,
        kind: SessionKind,
        amount: u64,
        transaction_id: String,
        original_timestamp: Option<String>,
        bonus_handled: bool,
        auth_code: Option<String>,
    ) -> TransactionRequest {
        let now = chrono::Local::now();
        let timestamp = match kind {
            // Reversal and Retrieve refer to the original transaction.
            SessionKind::Reversal | SessionKind::Retrieve => original_timestamp.unwrap_or_default(),
            SessionKind::Payment | SessionKind::Refund => {
                now.format("%y%m%d%H%M%S").to_string()
            }
        };
        TransactionRequest {
            transaction_type: match kind {
                SessionKind::Payment => TransactionType::Payment,
                SessionKind::Refund => TransactionType::Refund,
                SessionKind::Reversal => TransactionType::Reversal,
                SessionKind::Retrieve => TransactionType::Retrieve,
            },
            amount,
            transaction_id,
            bonus_handled,
            auth_code,
            timestamp,
            currency: self.config.currency.clone(),
            accounting_date: now.format("%y%m%d").to_string(),
            ecr_number: self.config.ecr_number,
        }
    }

    // ---------------------------------------------------------------------
    // Inbound message handling, on the pump task in wire order.
    // ---------------------------------------------------------------------

    async fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::Status(status) => self.handle_status(status).await,
            Message::Result(result) => self.handle_result(result).await,
            Message::AbortResult(abort) => self.handle_abort_result(abort),
            Message::CustomerResult(customer) => self.handle_customer_result(customer).await,
            Message::VerifySignature(data) => self.handle_verify_signature(data).await,
            Message::DeviceStatus(status) => self.emit(Event::DeviceStatus(status)),
            Message::Wakeup(_) => self.emit(Event::Wakeup),
        }
    }

    async fn handle_status(self: &Arc<Self>, status: TransactionStatus) {
        self.emit(Event::StatusChanged(status.clone()));

        if status.phase == PHASE_INITIALIZED {
            let assigned = {
                let mut sessions = self.lock_sessions();
                match sessions.active_mut() {
                    Some(session) if session.has_placeholder_id() && !status.info.is_empty() => {
                        session.transaction_id = status.info.clone();
                        true
                    }
                    _ => false,
                }
            };
            if assigned {
                self.emit(Event::TransactionInitialized {
                    transaction_id: status.info.clone(),
                });
            }
        }
        if let Some(session) = self.lock_sessions().active_mut() {
            session.last_status = Some(status.clone());
        }

        match status.class() {
            StatusClass::Informational | StatusClass::Silent => {}
            StatusClass::BonusCardFound => self.handle_bonus_found(&status).await,
            StatusClass::BonusCardOnly => self.handle_bonus_only(&status),
            StatusClass::ManualEntry(kind) => self.route_manual_entry(kind, &status).await,
            StatusClass::Confirmation => {
                let prompt = UserPrompt {
                    result_code: status.result_code.clone(),
                    info: status.info.clone(),
                };
                self.route_confirmation(prompt).await;
            }
            StatusClass::TerminalAbort => self.handle_terminal_abort(&status),
        }
    }

    /// A bonus card turned up during a payment: halt the session and run
    /// the same payment again with the bonus marked handled.
    async fn handle_bonus_found(self: &Arc<Self>, status: &TransactionStatus) {
        let restart = {
            let mut sessions = self.lock_sessions();
            match sessions.active_mut() {
                Some(session) if session.kind == SessionKind::Payment => {
                    let bonus = merge_bonus(session.bonus.take(), status);
                    session.bonus = Some(bonus);
                    session.transition(SessionState::BonusDetectedAndHalted);
                    Some((session.amount, session.transaction_id.clone()))
                }
                _ => None,
            }
        };
        let Some((amount, transaction_id)) = restart else {
            return;
        };
        log::info!("bonus card detected, restarting payment {transaction_id} with bonus handled");
        self.start_transaction(TransactionPlan {
            kind: SessionKind::Payment,
            amount,
            transaction_id: Some(transaction_id),
            original_timestamp: None,
            bonus_handled: true,
            session_id: None,
            guarded: false,
        });
    }

    /// A bonus card was presented without a payment card: the transaction
    /// is over, and the bonus mode is switched off after a grace period.
    fn handle_bonus_only(self: &Arc<Self>, status: &TransactionStatus) {
        let bonus = {
            let mut sessions = self.lock_sessions();
            match sessions.active_mut() {
                Some(session) if session.kind == SessionKind::Payment => {
                    let bonus = merge_bonus(session.bonus.take(), status);
                    session.bonus = Some(bonus.clone());
                    session.transition(SessionState::Aborted);
                    bonus
                }
                _ => merge_bonus(None, status),
            }
        };
        self.emit(Event::Bonus(bonus));
        self.emit(Event::TerminalAbort {
            phase: status.phase,
            result_code: status.result_code.clone(),
            info: status.info.clone(),
        });

        let this = Arc::clone(self);
        let delay = Duration::from_millis(self.config.bonus_disable_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = this
                .send_framed(BonusCardMode::Disable.encode(), "BonusCardMode")
                .await;
        });
    }

    fn handle_terminal_abort(&self, status: &TransactionStatus) {
        if let Some(session) = self.lock_sessions().active_mut() {
            session.transition(SessionState::TerminalAborted);
        }
        self.emit(Event::TerminalAbort {
            phase: status.phase,
            result_code: status.result_code.clone(),
            info: status.info.clone(),
        });
    }

    async fn route_manual_entry(self: &Arc<Self>, kind: ManualEntryKind, status: &TransactionStatus) {
        let prompt = UserPrompt {
            result_code: status.result_code.clone(),
            info: status.info.clone(),
        };
        self.emit(Event::UserPrompt(prompt.clone()));
        let mut handled = false;
        if self.policy.allow_manual_authorization(&prompt.result_code) {
            match self.policy.manual_entry(&prompt) {
                Some(input) if kind.validate(&input) => {
                    match kind {
                        ManualEntryKind::AuthorizationCode => {
                            self.resend_with_auth_code(input).await
                        }
                        ManualEntryKind::LastFourDigits => self.rerun_last_payment().await,
                    }
                    handled = true;
                }
                Some(_) => log::warn!("manual entry failed validation, aborting"),
                None => {}
            }
        }
        if !handled {
            self.abort_active().await;
        }
        self.policy.post_process(&prompt);
    }

    async fn route_confirmation(self: &Arc<Self>, prompt: UserPrompt) {
        self.emit(Event::UserPrompt(prompt.clone()));
        if !self.policy.allow_user_prompt(&prompt.result_code) {
            self.abort_active().await;
        } else {
            let accepted = self.policy.confirm(&prompt);
            if prompt.result_code == STATUS_ACCEPT_OR_REJECT {
                let transaction_id = parse_transaction_id(&prompt.info)
                    .or_else(|| self.active_transaction_id())
                    .unwrap_or_else(|| PLACEHOLDER_TRANSACTION_ID.to_string());
                let message = AcceptOrReject {
                    transaction_id,
                    accept: accepted,
                };
                let command = if accepted {
                    "AcceptTransaction"
                } else {
                    "RejectTransaction"
                };
                let _ = self.send_framed(message.encode(), command).await;
            } else if accepted {
                self.rerun_last_payment().await;
            } else {
                self.abort_active().await;
            }
        }
        self.policy.post_process(&prompt);
    }

    /// Re-sends the active payment with the manually entered auth code;
    /// the session is kept.
    async fn resend_with_auth_code(self: &Arc<Self>, code: String) {
        let request = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.active_mut() else {
                return;
            };
            session.manual_auth_code = Some(code.clone());
            self.transaction_request(
                SessionKind::Payment,
                session.amount,
                session.transaction_id.clone(),
                None,
                session.bonus_handled,
                Some(code),
            )
        };
        let _ = self.send_framed(request.encode(), "Payment").await;
    }

    /// Closes the active session and runs the previous payment again.
    async fn rerun_last_payment(self: &Arc<Self>) {
        if let Some(session) = self.lock_sessions().active_mut() {
            session.transition(SessionState::Aborted);
        }
        let params = self
            .last_payment
            .lock()
            .expect("last payment poisoned")
            .clone();
        match params {
            Some(params) => self.start_transaction(TransactionPlan {
                kind: SessionKind::Payment,
                amount: params.amount,
                transaction_id: None,
                original_timestamp: None,
                bonus_handled: params.bonus_handled,
                session_id: None,
                guarded: false,
            }),
            None => {
                let _ = self.send_framed(AbortTransaction.encode(), "Abort").await;
            }
        }
    }

    /// Aborts on behalf of a refused prompt: the session closes right away
    /// instead of waiting for the abort result.
    async fn abort_active(self: &Arc<Self>) {
        if let Some(session) = self.lock_sessions().active_mut() {
            session.transition(SessionState::Aborted);
        }
        let _ = self.send_framed(AbortTransaction.encode(), "Abort").await;
    }

    async fn handle_result(self: &Arc<Self>, result: ecrlink::packets::TransactionResult) {
        let outcome = {
            let mut sessions = self.lock_sessions();
            let active_id = sessions.active().map(|s| s.id.clone());
            match active_id {
                Some(id) => {
                    let inherited = sessions.inherited_bonus(&id);
                    let session = sessions.get_mut(&id).expect("active session vanished");
                    session.transition(SessionState::Completed);
                    let bonus = session.bonus.clone().or(inherited);
                    TransactionOutcome {
                        session_id: Some(id),
                        kind: Some(session.kind),
                        result,
                        bonus,
                    }
                }
                None => TransactionOutcome {
                    session_id: None,
                    kind: None,
                    result,
                    bonus: None,
                },
            }
        };

        let event = match outcome.kind {
            Some(SessionKind::Payment) => Event::Purchase(outcome.clone()),
            Some(SessionKind::Refund) => Event::Refund(outcome.clone()),
            Some(SessionKind::Reversal) => Event::Reversal(outcome.clone()),
            Some(SessionKind::Retrieve) => Event::Retrieve(outcome.clone()),
            None => Event::Result(outcome.clone()),
        };
        self.emit(event);

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let record = TransactionRecord {
                completed_at: Utc::now(),
                session_id: outcome.session_id.clone(),
                kind: outcome.kind,
                result: outcome.result.clone(),
                bonus: outcome.bonus.clone(),
            };
            tokio::task::spawn_blocking(move || {
                if let Err(error) = store.store(&record) {
                    log::warn!("failed to archive transaction: {error:#}");
                }
            });
        }
    }

    fn handle_abort_result(&self, abort: AbortTransactionResult) {
        let aborted = abort.aborted();
        let message = if aborted {
            "transaction aborted".to_string()
        } else {
            format!("transaction not aborted (code {})", abort.result_code)
        };
        self.emit(Event::AbortResult { aborted, message });
        if aborted {
            if let Some(session) = self.lock_sessions().active_mut() {
                session.transition(SessionState::Aborted);
            }
        }
    }

    async fn handle_customer_result(self: &Arc<Self>, data: CustomerRequestResult) {
        let updated = {
            let mut sessions = self.lock_sessions();
            match sessions.active_mut() {
                Some(session) if session.kind == SessionKind::Payment => {
                    let mut bonus = session.bonus.take().unwrap_or_default();
                    bonus.customer_number = data.customer_number.clone();
                    bonus.member_class = data.member_class.clone();
                    bonus.status_code = data.status.to_string();
                    session.bonus = Some(bonus.clone());
                    Some(bonus)
                }
                _ => None,
            }
        };
        match updated {
            Some(bonus) => self.emit(Event::Bonus(bonus)),
            None => {
                // Nothing to attach the card to; switch the reader off again.
                let _ = self
                    .send_framed(BonusCardMode::Disable.encode(), "BonusCardMode")
                    .await;
            }
        }
    }

    async fn handle_verify_signature(self: &Arc<Self>, data: VerifySignature) {
        let prompt = UserPrompt {
            result_code: RETRY_TRANSACTION_CODE.to_string(),
            info: data.text,
        };
        self.route_confirmation(prompt).await;
    }

    // ---------------------------------------------------------------------
    // Small helpers.
    // ---------------------------------------------------------------------

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, SessionLedger> {
        self.sessions.lock().expect("sessions mutex poisoned")
    }

    fn active_transaction_id(&self) -> Option<String> {
        self.lock_sessions()
            .active()
            .map(|s| s.transaction_id.clone())
    }

    fn next_session_id(&self) -> String {
        format!("{:06}", self.session_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn emit(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    fn emit_error(&self, error: &Error) {
        let event = match error {
            Error::Link(LinkError::Timeout { attempts }) => ErrorEvent::Timeout {
                attempts: *attempts,
                message: error.to_string(),
            },
            Error::Link(_) => ErrorEvent::Communication {
                message: error.to_string(),
            },
            Error::Validation(message) => ErrorEvent::Validation {
                message: message.clone(),
            },
        };
        self.emit(Event::Error(event));
    }
}

fn merge_bonus(existing: Option<BonusInfo>, status: &TransactionStatus) -> BonusInfo {
    let mut bonus = existing.unwrap_or_default();
    if !status.info.is_empty() {
        bonus.customer_number = status.info.clone();
    }
    bonus.status_code = status.result_code.clone();
    bonus
}

#[cfg(test)]
mod __send_probe {
    use super::*;
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    #[test]
    fn probe() {
        assert_send::<TerminalManager>();
        assert_sync::<TerminalManager>();
        assert_send::<Error>();
    }
}

/// Picks the first run of five digits out of a prompt info field.
fn parse_transaction_id(info: &str) -> Option<String> {
    info.trim()
        .as_bytes()
        .windows(5)
        .find(|w| w.iter().all(u8::is_ascii_digit))
        .map(|w| String::from_utf8_lossy(w).into_owned())
}
