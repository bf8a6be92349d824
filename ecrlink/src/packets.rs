//! The wire messages of the terminal's ECR interface.
//!
//! Every message is a fixed-layout single-byte-charset record whose first
//! byte is the message id. Requests are built with [TransactionRequest] and
//! the short control messages below; responses are decoded via
//! [Message::parse].

use crate::charset;
use crate::constants::{
    FS, RETRY_TRANSACTION_CODE, STATUS_ACCEPT_OR_REJECT, STATUS_BONUS_CARD_FOUND,
    STATUS_BONUS_CARD_ONLY, STATUS_MANUAL_AUTH_CODE, STATUS_MANUAL_LAST_DIGITS,
};
use serde::Serialize;

/// Wakeup, terminal to ECR.
pub const MSG_WAKEUP: u8 = b'W';
/// Transaction status, terminal to ECR.
pub const MSG_STATUS: u8 = b'2';
/// Transaction result, short layout.
pub const MSG_RESULT: u8 = b'4';
/// Transaction result, extended layout.
pub const MSG_RESULT_EXTENDED: u8 = b'5';
/// Abort-transaction result.
pub const MSG_ABORT_RESULT: u8 = b'7';
/// Customer (bonus card) request result.
pub const MSG_CUSTOMER_RESULT: u8 = b'D';
/// Signature verification request.
pub const MSG_VERIFY_SIGNATURE: u8 = b'F';
/// Device status / device-control result.
pub const MSG_DEVICE_STATUS: u8 = b'S';

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("unknown message id 0x{0:02x}")]
    UnknownMessageId(u8),

    #[error("message '{id}' too short: {len} bytes, need {min}")]
    TooShort { id: char, len: usize, min: usize },

    #[error("field {0} is not numeric")]
    BadNumber(&'static str),
}

fn text(payload: &[u8], range: std::ops::Range<usize>) -> String {
    charset::decode(&payload[range]).trim_end().to_string()
}

fn number(payload: &[u8], range: std::ops::Range<usize>, field: &'static str) -> Result<u64, DecodeError> {
    charset::decode(&payload[range])
        .trim()
        .parse()
        .map_err(|_| DecodeError::BadNumber(field))
}

fn check_len(id: char, payload: &[u8], min: usize) -> Result<(), DecodeError> {
    if payload.len() < min {
        return Err(DecodeError::TooShort {
            id,
            len: payload.len(),
            min,
        });
    }
    Ok(())
}

/// Manual-entry prompts as distinguished by their status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManualEntryKind {
    /// `2003`: an authorization code of 4 to 6 digits.
    AuthorizationCode,
    /// `2007`: the last four digits of the card number.
    LastFourDigits,
}

impl ManualEntryKind {
    /// Validates the typed-in digits for this prompt.
    pub fn validate(self, input: &str) -> bool {
        let all_digits = !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit());
        match self {
            Self::AuthorizationCode => all_digits && (4..=6).contains(&input.len()),
            Self::LastFourDigits => all_digits && input.len() == 4,
        }
    }
}

/// How a status result code is to be acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// `0xxx`: purely informational.
    Informational,
    /// `2001`: a bonus card was read during a payment.
    BonusCardFound,
    /// `2002`: a bonus card was presented without a payment card.
    BonusCardOnly,
    /// Prompts asking for typed-in digits; subject to the
    /// manual-authorization policy.
    ManualEntry(ManualEntryKind),
    /// Confirmation-only prompts; subject to the user-prompt policy.
    Confirmation,
    /// `1xxx`/`9xxx` not handled otherwise: the terminal gave up.
    TerminalAbort,
    /// Anything else is forwarded as a status change and nothing more.
    Silent,
}

/// Transaction status (`2`): phase tag, result code and free-form info.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStatus {
    pub phase: char,
    pub result_code: String,
    pub info: String,
}

impl TransactionStatus {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len('2', payload, 6)?;
        Ok(Self {
            phase: payload[1] as char,
            result_code: charset::decode(&payload[2..6]),
            info: text(payload, 6..payload.len()),
        })
    }

    pub fn class(&self) -> StatusClass {
        match self.result_code.as_str() {
            STATUS_BONUS_CARD_FOUND => StatusClass::BonusCardFound,
            STATUS_BONUS_CARD_ONLY => StatusClass::BonusCardOnly,
            STATUS_MANUAL_AUTH_CODE => StatusClass::ManualEntry(ManualEntryKind::AuthorizationCode),
            STATUS_MANUAL_LAST_DIGITS => StatusClass::ManualEntry(ManualEntryKind::LastFourDigits),
            "2004" | "2005" | "2006" | "2012" => StatusClass::Confirmation,
            STATUS_ACCEPT_OR_REJECT => StatusClass::Confirmation,
            RETRY_TRANSACTION_CODE => StatusClass::Confirmation,
            code if code.starts_with('0') => StatusClass::Informational,
            code if code.starts_with('1') || code.starts_with('9') => StatusClass::TerminalAbort,
            _ => StatusClass::Silent,
        }
    }
}

/// Transaction result (`4` short / `5` extended), fixed offsets.
///
/// A result shorter than 137 bytes is invalid; anything longer selects the
/// extended layout with a 12-digit amount field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionResult {
    pub extended: bool,
    pub transaction_type: char,
    pub payment_method: char,
    pub card_type: char,
    pub transaction_usage: char,
    pub settlement_id: String,
    pub masked_card_number: String,
    pub aid: String,
    pub transaction_certificate: String,
    pub tvr: String,
    pub tsi: String,
    pub transaction_id: String,
    pub filing_code: String,
    /// `yyMMddHHmmss`, as sent.
    pub timestamp: String,
    /// Minor currency units.
    pub amount: u64,
    pub currency: String,
    pub reader_serial_number: String,
    pub print_payee_receipt: bool,
    pub flags: String,
    pub payer_receipt: String,
    pub payee_receipt: String,
}

impl TransactionResult {
    /// Shortest valid result: the short layout up to and including the
    /// print-payee digit.
    pub const MIN_LEN: usize = 137;

    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let id = *payload.first().ok_or(DecodeError::Empty)? as char;
        check_len(id, payload, Self::MIN_LEN)?;
        let extended = payload.len() > Self::MIN_LEN;
        let (amount_width, currency_at, serial_at, payee_at, flags_at) = if extended {
            (12, 129, 132, 141, 142)
        } else {
            (7, 124, 127, 136, 137)
        };
        if extended {
            // The extended layout only reaches the print-payee digit at 142.
            check_len(id, payload, flags_at)?;
        }

        let flags = if payload.len() > flags_at {
            charset::decode(&payload[flags_at..flags_at + 1])
        } else {
            String::new()
        };
        let (payer_receipt, payee_receipt) = if payload.len() > flags_at + 1 {
            let mut remainder = &payload[flags_at + 1..];
            while remainder.last() == Some(&crate::constants::ETX) {
                remainder = &remainder[..remainder.len() - 1];
            }
            match remainder
                .iter()
                .position(|&b| b == crate::constants::RS)
            {
                Some(split) => (
                    charset::decode(&remainder[..split]),
                    charset::decode(&remainder[split + 1..]),
                ),
                None => (charset::decode(remainder), String::new()),
            }
        } else {
            (String::new(), String::new())
        };

        Ok(Self {
            extended,
            transaction_type: payload[1] as char,
            payment_method: payload[2] as char,
            card_type: payload[3] as char,
            transaction_usage: payload[4] as char,
            settlement_id: text(payload, 5..7),
            masked_card_number: text(payload, 7..26),
            aid: text(payload, 26..58),
            transaction_certificate: text(payload, 58..74),
            tvr: text(payload, 74..84),
            tsi: text(payload, 84..88),
            transaction_id: charset::decode(&payload[88..93]),
            filing_code: text(payload, 93..105),
            timestamp: charset::decode(&payload[105..117]),
            amount: number(payload, 117..117 + amount_width, "amount")?,
            currency: charset::decode(&payload[currency_at..currency_at + 3]),
            reader_serial_number: text(payload, serial_at..serial_at + 9),
            print_payee_receipt: payload[payee_at] != b'0',
            flags,
            payer_receipt,
            payee_receipt,
        })
    }
}

/// Abort-transaction result (`7`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbortTransactionResult {
    pub result_code: String,
}

impl AbortTransactionResult {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len('7', payload, 4)?;
        Ok(Self {
            result_code: charset::decode(&payload[1..4]),
        })
    }

    /// True when the running transaction was actually aborted.
    pub fn aborted(&self) -> bool {
        self.result_code == crate::constants::ABORTED_RESULT_CODE
    }
}

/// Customer request result (`D`): bonus-card data read by the terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerRequestResult {
    pub status: char,
    pub customer_number: String,
    pub member_class: String,
}

impl CustomerRequestResult {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len('D', payload, 24)?;
        Ok(Self {
            status: payload[1] as char,
            customer_number: text(payload, 2..22),
            member_class: charset::decode(&payload[22..24]),
        })
    }
}

/// Signature verification request (`F`): the cashier compares signatures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifySignature {
    pub text: String,
}

impl VerifySignature {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len('F', payload, 1)?;
        Ok(Self {
            text: text(payload, 1..payload.len()),
        })
    }
}

/// Device status (`S`), the answer to a device-control query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub result_code: String,
    pub reader_state: char,
    pub environment: char,
    /// A control-system (TCS) message is waiting to be retrieved.
    pub message_present: bool,
    pub data: String,
    /// The undissected message for diagnostics.
    pub raw: String,
}

impl DeviceStatus {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len('S', payload, 8)?;
        Ok(Self {
            result_code: charset::decode(&payload[1..5]),
            reader_state: payload[5] as char,
            environment: payload[6] as char,
            message_present: payload[7] != b'0',
            data: text(payload, 8..payload.len()),
            raw: charset::decode(payload),
        })
    }
}

/// Wakeup (`W`), sent by the terminal after power-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wakeup;

/// All messages the terminal may send, routed by message id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Message {
    Wakeup(Wakeup),
    Status(TransactionStatus),
    Result(TransactionResult),
    AbortResult(AbortTransactionResult),
    CustomerResult(CustomerRequestResult),
    VerifySignature(VerifySignature),
    DeviceStatus(DeviceStatus),
}

impl Message {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let id = *payload.first().ok_or(DecodeError::Empty)?;
        match id {
            MSG_WAKEUP => Ok(Self::Wakeup(Wakeup)),
            MSG_STATUS => TransactionStatus::parse(payload).map(Self::Status),
            MSG_RESULT | MSG_RESULT_EXTENDED => TransactionResult::parse(payload).map(Self::Result),
            MSG_ABORT_RESULT => AbortTransactionResult::parse(payload).map(Self::AbortResult),
            MSG_CUSTOMER_RESULT => CustomerRequestResult::parse(payload).map(Self::CustomerResult),
            MSG_VERIFY_SIGNATURE => VerifySignature::parse(payload).map(Self::VerifySignature),
            MSG_DEVICE_STATUS => DeviceStatus::parse(payload).map(Self::DeviceStatus),
            other => Err(DecodeError::UnknownMessageId(other)),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Wakeup(_) => write!(f, "Wakeup ('W')"),
            Message::Status(_) => write!(f, "TransactionStatus ('2')"),
            Message::Result(data) if data.extended => write!(f, "TransactionResult ('5')"),
            Message::Result(_) => write!(f, "TransactionResult ('4')"),
            Message::AbortResult(_) => write!(f, "AbortTransactionResult ('7')"),
            Message::CustomerResult(_) => write!(f, "CustomerRequestResult ('D')"),
            Message::VerifySignature(_) => write!(f, "VerifySignature ('F')"),
            Message::DeviceStatus(_) => write!(f, "DeviceStatus ('S')"),
        }
    }
}

/// Appends `value` as a left-zero-padded decimal of exactly `width` digits.
fn push_numeric(out: &mut Vec<u8>, value: u64, width: usize) {
    let digits = format!("{value:0width$}");
    out.extend_from_slice(&digits.as_bytes()[digits.len() - width..]);
}

/// Appends `text`, left-padded with zeros to `width` bytes.
fn push_zero_padded(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = charset::encode(value);
    if bytes.len() >= width {
        out.extend_from_slice(&bytes[bytes.len() - width..]);
    } else {
        out.extend(std::iter::repeat(b'0').take(width - bytes.len()));
        out.extend_from_slice(&bytes);
    }
}

/// Appends `bytes` truncated to and space-padded up to `width`.
fn push_space_padded(out: &mut Vec<u8>, bytes: &[u8], width: usize) {
    let take = bytes.len().min(width);
    out.extend_from_slice(&bytes[..take]);
    out.extend(std::iter::repeat(b' ').take(width - take));
}

/// Appends a timestamp field; an empty value encodes as all zeros.
fn push_timestamp(out: &mut Vec<u8>, value: &str, width: usize) {
    if value.is_empty() {
        out.extend(std::iter::repeat(b'0').take(width));
    } else {
        push_zero_padded(out, value, width);
    }
}

/// Appends the 7-byte auth-code slot: the code followed by FS fill.
fn push_auth_code(out: &mut Vec<u8>, code: Option<&str>) {
    let bytes = code.map(charset::encode).unwrap_or_default();
    let take = bytes.len().min(7);
    out.extend_from_slice(&bytes[..take]);
    out.extend(std::iter::repeat(FS).take(7 - take));
}

/// Transaction kinds as encoded in the request's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionType {
    Payment,
    Refund,
    Reversal,
    Retrieve,
}

impl TransactionType {
    fn wire_char(self) -> u8 {
        match self {
            Self::Payment => b'0',
            Self::Refund => b'1',
            Self::Reversal => b'2',
            Self::Retrieve => b'3',
        }
    }
}

/// The fixed 80-byte transaction request (`y`).
///
/// Reversal and Retrieve carry a zero amount and the original transaction's
/// id and timestamp verbatim; Payment and Refund use a fresh timestamp and
/// the placeholder id.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub transaction_type: TransactionType,
    /// Minor currency units; zero for Reversal/Retrieve.
    pub amount: u64,
    pub transaction_id: String,
    pub bonus_handled: bool,
    /// Manually entered authorization code, if any.
    pub auth_code: Option<String>,
    /// `yyMMddHHmmss`; empty encodes as all zeros.
    pub timestamp: String,
    /// ISO 4217 numeric code, e.g. `978`.
    pub currency: String,
    /// `yyMMdd` accounting date.
    pub accounting_date: String,
    pub ecr_number: u16,
}

impl TransactionRequest {
    pub const LEN: usize = 80;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(b'y');
        out.push(self.transaction_type.wire_char());
        push_numeric(&mut out, self.amount, 12);
        push_numeric(&mut out, 0, 12); // other amount, unused
        push_zero_padded(&mut out, &self.transaction_id, 5);
        out.push(b'0'); // force online
        out.push(b'0'); // manual entry
        out.push(if self.bonus_handled { b'1' } else { b'0' });
        push_auth_code(&mut out, self.auth_code.as_deref());
        push_timestamp(&mut out, &self.timestamp, 12);
        push_numeric(&mut out, 0, 9); // reader serial, assigned by the terminal
        out.push(b'0'); // payment restriction
        out.push(b'0'); // surcharge
        out.push(b'0'); // look for date of birth
        out.push(b'0'); // flags
        out.push(b'0'); // reserved
        push_zero_padded(&mut out, &self.currency, 3);
        push_timestamp(&mut out, &self.accounting_date, 6);
        out.push(b'0'); // accounting sequence
        push_numeric(&mut out, self.ecr_number as u64, 3);
        debug_assert_eq!(out.len(), Self::LEN);
        out
    }
}

/// Abort the running transaction: `7` `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortTransaction;

impl AbortTransaction {
    pub fn encode(&self) -> Vec<u8> {
        vec![b'7', b'2']
    }
}

/// Accept (`1`) or reject (`9`) a paused transaction: `$`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptOrReject {
    pub transaction_id: String,
    pub accept: bool,
}

impl AcceptOrReject {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![b'$'];
        push_zero_padded(&mut out, &self.transaction_id, 5);
        out.push(if self.accept { b'1' } else { b'9' });
        push_numeric(&mut out, 0, 9);
        out
    }
}

/// Font selection of [DisplayText].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOption {
    Clear,
    SmallFont,
    BigFont,
}

impl DisplayOption {
    fn wire_char(self) -> u8 {
        match self {
            Self::Clear => b'0',
            Self::SmallFont => b'1',
            Self::BigFont => b'2',
        }
    }
}

/// Display text on the terminal (`Z`): two lines of at most 21 bytes.
///
/// A line that does not fit silently downgrades the message to the small
/// font and is truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayText {
    pub line1: String,
    pub line2: String,
    pub option: DisplayOption,
}

impl DisplayText {
    const LINE_LEN: usize = 21;

    pub fn encode(&self) -> Vec<u8> {
        let line1 = charset::encode(&self.line1);
        let line2 = charset::encode(&self.line2);
        let mut option = self.option;
        if line1.len() > Self::LINE_LEN || line2.len() > Self::LINE_LEN {
            option = DisplayOption::SmallFont;
        }
        let mut out = vec![b'Z', option.wire_char()];
        push_space_padded(&mut out, &line1, Self::LINE_LEN);
        push_space_padded(&mut out, &line2, Self::LINE_LEN);
        push_space_padded(&mut out, b"", 4);
        out
    }
}

/// Auxiliary accept mode: `S` `2` (`1` set / `0` reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxiliaryMode {
    pub enable: bool,
}

impl AuxiliaryMode {
    pub fn encode(&self) -> Vec<u8> {
        vec![b'S', b'2', if self.enable { b'1' } else { b'0' }]
    }
}

/// Device-control queries: `s` `0` + query selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceQuery {
    Status,
    TcsMessage,
    Version,
}

impl DeviceQuery {
    pub fn encode(&self) -> Vec<u8> {
        let selector = match self {
            Self::Status => b'0',
            Self::TcsMessage => b'1',
            Self::Version => b'2',
        };
        vec![b's', b'0', selector]
    }
}

/// Bonus-card mode: `C` + activation + three fixed zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BonusCardMode {
    Disable,
    Enable,
    /// Enable with automatic reply to the customer request.
    EnableAutoReply,
}

impl BonusCardMode {
    pub fn encode(&self) -> Vec<u8> {
        let activation = match self {
            Self::Disable => b'0',
            Self::Enable => b'1',
            Self::EnableAutoReply => b'2',
        };
        vec![b'C', activation, b'0', b'0', b'0']
    }
}

/// Customer (bonus card) request: `D` + raw activation byte.
///
/// The activation byte is documented as stop (0) / keep active (1), but
/// some firmwares ignore it; nothing here depends on the response telling
/// the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomerRequest {
    pub keep_active: bool,
}

impl CustomerRequest {
    pub fn encode(&self) -> Vec<u8> {
        vec![b'D', u8::from(self.keep_active)]
    }
}
