//! Control bytes and well-known codes of the terminal's ECR interface.

/// Start of a framed part.
pub const STX: u8 = 0x02;
/// End of a framed part; the last byte covered by the LRC.
pub const ETX: u8 = 0x03;
/// Handshake byte sent by the host; answered with ACK.
pub const ENQ: u8 = 0x05;
/// Positive acknowledge.
pub const ACK: u8 = 0x06;
/// Negative acknowledge; requests retransmission of the last part.
pub const NAK: u8 = 0x15;
/// Continuation marker. A part whose body ends with ETB is followed by
/// another part of the same logical payload.
pub const ETB: u8 = 0x17;
/// In-field terminator, used to pad the auth-code slot of a transaction
/// request.
pub const FS: u8 = 0x1c;
/// Separator between the payer and the payee receipt in a transaction
/// result.
pub const RS: u8 = 0x1e;

/// Transaction id of a request the terminal has not numbered yet.
pub const PLACEHOLDER_TRANSACTION_ID: &str = "00000";

/// Phase tag of status messages announcing "transaction initialized". The
/// info field of the first such status carries the assigned transaction id.
pub const PHASE_INITIALIZED: char = 'A';

/// Result code of an abort-transaction result meaning the transaction was
/// actually aborted.
pub const ABORTED_RESULT_CODE: &str = "721";

/// Synthetic result code for retry prompts. Never sent by the terminal; the
/// host uses it to route signature-verification and retry confirmations
/// through the regular prompt policy.
pub const RETRY_TRANSACTION_CODE: &str = "A000";

/// Status code: a bonus card was found during a payment.
pub const STATUS_BONUS_CARD_FOUND: &str = "2001";
/// Status code: a bonus card was presented without a payment card.
pub const STATUS_BONUS_CARD_ONLY: &str = "2002";
/// Status code: the terminal asks for a manually entered auth code.
pub const STATUS_MANUAL_AUTH_CODE: &str = "2003";
/// Status code: the terminal asks for the last four digits of the card.
pub const STATUS_MANUAL_LAST_DIGITS: &str = "2007";
/// Status code: the terminal paused the transaction and awaits an
/// accept-or-reject decision.
pub const STATUS_ACCEPT_OR_REJECT: &str = "2022";
