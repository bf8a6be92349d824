//! Wire-level round trips through the public API: a terminal conversation
//! as byte sequences, without a port.

use ecrlink::constants::{ACK, STX};
use ecrlink::frame::{self, FrameAssembler, FrameEvent};
use ecrlink::packets::{Message, TransactionRequest, TransactionType};

/// Feeds raw wire bytes the way the reader does and returns the decoded
/// messages plus the flow-control bytes the host would answer.
fn terminal_says(bytes: &[u8]) -> (Vec<Message>, Vec<u8>) {
    let mut assembler = FrameAssembler::new();
    let mut messages = Vec::new();
    let mut answers = Vec::new();
    for &byte in bytes {
        if assembler.in_frame() {
            match assembler.feed(byte) {
                None => {}
                Some(FrameEvent::BadLrc) => answers.push(0x15),
                Some(FrameEvent::Part { payload }) => {
                    answers.push(ACK);
                    if let Some(payload) = payload {
                        messages.push(Message::parse(&payload).unwrap());
                    }
                }
            }
        } else if byte == STX {
            assembler.start_part();
        }
    }
    (messages, answers)
}

#[test]
fn test_purchase_conversation() {
    // The terminal walks a payment through initialization, status and
    // result; every part is acknowledged once.
    let mut wire = Vec::new();
    wire.extend(frame::build(b"2A000000042"));
    wire.extend(frame::build(b"2B0013PROCESSING"));
    let mut result = b"40010".to_vec();
    result.extend_from_slice(format!("{:<2}", "07").as_bytes());
    result.extend_from_slice(format!("{:<19}", "541333**1234").as_bytes());
    result.extend_from_slice(format!("{:<32}", "A0000000041010").as_bytes());
    result.extend_from_slice(format!("{:<16}", "1F03A2").as_bytes());
    result.extend_from_slice(format!("{:<10}", "0000048000").as_bytes());
    result.extend_from_slice(b"E800");
    result.extend_from_slice(b"00042");
    result.extend_from_slice(b"000000000017");
    result.extend_from_slice(b"240517134530");
    result.extend_from_slice(b"0001234");
    result.extend_from_slice(b"978");
    result.extend_from_slice(b"000012345");
    result.push(b'1');
    wire.extend(frame::build(&result));

    let (messages, answers) = terminal_says(&wire);
    assert_eq!(answers, vec![ACK, ACK, ACK]);
    assert_eq!(messages.len(), 3);

    let Message::Status(status) = &messages[0] else {
        panic!("expected a status, got {:?}", messages[0]);
    };
    assert_eq!(status.phase, 'A');
    assert_eq!(status.info, "00042");

    let Message::Result(result) = &messages[2] else {
        panic!("expected a result, got {:?}", messages[2]);
    };
    assert_eq!(result.transaction_id, "00042");
    assert_eq!(result.amount, 1234);
}

#[test]
fn test_split_status_message() {
    // The same status spread over three ETB-continued parts.
    let payload = b"2B0013PLEASE WAIT";
    let (messages, answers) = terminal_says(
        &[
            frame::build(b"2B0013\x17"),
            frame::build(b"PLEASE \x17"),
            frame::build(b"WAIT"),
        ]
        .concat(),
    );
    assert_eq!(answers, vec![ACK, ACK, ACK]);
    assert_eq!(messages, vec![Message::parse(payload).unwrap()]);
}

#[test]
fn test_payment_request_bytes() {
    // A 12,34 purchase encodes to the documented 80-byte record.
    let request = TransactionRequest {
        transaction_type: TransactionType::Payment,
        amount: 1234,
        transaction_id: "00000".to_string(),
        bonus_handled: false,
        auth_code: None,
        timestamp: "240517134530".to_string(),
        currency: "978".to_string(),
        accounting_date: "240517".to_string(),
        ecr_number: 1,
    };
    let payload = request.encode();
    assert_eq!(payload.len(), 80);
    assert!(payload.starts_with(b"y0000000001234000000000000"));

    let framed = frame::build(&payload);
    assert_eq!(framed.len(), 83);
    assert_eq!(framed[0], STX);
    assert_eq!(framed[81], 0x03);
    assert_eq!(framed[82], frame::lrc(&framed[1..82]));
}
