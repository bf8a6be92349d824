//! The protocol engine: one reader, one sender, a first-byte rendezvous.
//!
//! The reader is a dedicated thread blocking on port reads; it classifies
//! ACK/NAK/STX, reassembles frames, answers ACK/NAK and hands decoded
//! messages to the embedder over a channel. The sender serializes outgoing
//! frames and meets the reader at the rendezvous cell holding the first
//! byte the terminal answered with.

use crate::constants::{ACK, ENQ, NAK, STX};
use crate::frame::{self, FrameAssembler, FrameEvent};
use crate::packets::Message;
use crate::port::BytePort;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("terminal link failed: {0}")]
    Communication(#[from] std::io::Error),

    #[error("no response from terminal: {attempts} of {attempts} attempts failed")]
    Timeout { attempts: u32 },

    #[error("terminal link is closed")]
    Closed,
}

/// What the reader observed on the wire, in wire order.
#[derive(Debug)]
pub enum LinkEvent {
    /// A completed, LRC-valid logical payload, decoded by message id.
    Message(Message),
    /// The reader terminated. `error` carries the I/O failure, or [None]
    /// after an orderly close.
    Closed { error: Option<std::io::Error> },
}

/// Timing knobs of the engine; all delays are configurable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkTiming {
    /// Turnaround delay before answering ACK/NAK to an inbound part.
    #[serde(default = "ack_delay_ms")]
    pub ack_delay_ms: u64,

    /// Per-attempt wait for the first response byte.
    #[serde(default = "send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "send_retries")]
    pub send_retries: u32,
}

const fn ack_delay_ms() -> u64 {
    100
}

const fn send_timeout_ms() -> u64 {
    3000
}

const fn send_retries() -> u32 {
    3
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            ack_delay_ms: ack_delay_ms(),
            send_timeout_ms: send_timeout_ms(),
            send_retries: send_retries(),
        }
    }
}

/// Single-slot rendezvous for the first byte seen after a write.
///
/// The sender resets the slot before each attempt; the reader fills it at
/// most once per arm. A leftover notify permit from a stale set is harmless,
/// the waiter re-checks the slot.
#[derive(Default)]
struct ResponseCell {
    slot: Mutex<Option<u8>>,
    notify: Notify,
}

impl ResponseCell {
    fn reset(&self) {
        *self.slot.lock().expect("rendezvous poisoned") = None;
    }

    fn offer(&self, byte: u8) {
        let mut slot = self.slot.lock().expect("rendezvous poisoned");
        if slot.is_none() {
            *slot = Some(byte);
            self.notify.notify_one();
        }
    }

    async fn wait(&self, timeout: Duration) -> Option<u8> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(byte) = *self.slot.lock().expect("rendezvous poisoned") {
                    return byte;
                }
                self.notify.notified().await;
            }
        })
        .await
        .ok()
    }
}

struct Reader {
    port: Box<dyn BytePort>,
    writer: Arc<Mutex<Box<dyn BytePort>>>,
    cell: Arc<ResponseCell>,
    events: UnboundedSender<LinkEvent>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    ack_delay: Duration,
    assembler: FrameAssembler,
}

impl Reader {
    fn run(mut self) {
        let error = self.read_loop().err();
        if let Some(error) = &error {
            log::warn!("reader terminated: {error}");
        }
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Closed { error });
    }

    fn read_loop(&mut self) -> std::io::Result<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let byte = match self.port.read_byte() {
                Ok(byte) => byte,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };
            self.handle_byte(byte)?;
        }
    }

    fn handle_byte(&mut self, byte: u8) -> std::io::Result<()> {
        if self.assembler.in_frame() {
            match self.assembler.feed(byte) {
                None => {}
                Some(FrameEvent::BadLrc) => {
                    log::warn!("LRC mismatch, requesting retransmission");
                    self.turnaround(NAK)?;
                }
                Some(FrameEvent::Part { payload }) => {
                    self.turnaround(ACK)?;
                    if let Some(payload) = payload {
                        self.dispatch(&payload);
                    }
                }
            }
            return Ok(());
        }

        match byte {
            ACK | NAK | STX => self.cell.offer(byte),
            _ => {}
        }
        match byte {
            STX => self.assembler.start_part(),
            ACK | NAK => {}
            other => log::debug!("ignoring stray byte 0x{other:02x}"),
        }
        Ok(())
    }

    /// Answers an inbound part after the configured turnaround delay.
    fn turnaround(&self, byte: u8) -> std::io::Result<()> {
        std::thread::sleep(self.ack_delay);
        self.writer
            .lock()
            .expect("port mutex poisoned")
            .write_all(&[byte])
    }

    fn dispatch(&self, payload: &[u8]) {
        log::debug!("read frame {}", hex::encode(payload));
        match Message::parse(payload) {
            Ok(message) => {
                log::debug!("received {message}");
                let _ = self.events.send(LinkEvent::Message(message));
            }
            Err(e) => log::warn!("dropping undecodable payload: {e}"),
        }
    }
}

/// The engine around one open port.
///
/// Created via [Transport::open]; the reader thread lives until the port
/// fails or [Transport::close] is called. At most one send is in flight at
/// any time, while the reader keeps acknowledging inbound traffic.
pub struct Transport {
    writer: Arc<Mutex<Box<dyn BytePort>>>,
    cell: Arc<ResponseCell>,
    timing: LinkTiming,
    send_lock: tokio::sync::Mutex<()>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Transport {
    /// Spawns the reader over `reader_port` and returns the engine together
    /// with the reader's event channel.
    pub fn open(
        reader_port: Box<dyn BytePort>,
        writer_port: Box<dyn BytePort>,
        timing: LinkTiming,
    ) -> (Self, UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        let writer = Arc::new(Mutex::new(writer_port));
        let cell = Arc::new(ResponseCell::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let reader = Reader {
            port: reader_port,
            writer: Arc::clone(&writer),
            cell: Arc::clone(&cell),
            events: events_tx,
            shutdown: Arc::clone(&shutdown),
            running: Arc::clone(&running),
            ack_delay: Duration::from_millis(timing.ack_delay_ms),
            assembler: FrameAssembler::new(),
        };
        let handle = std::thread::spawn(move || reader.run());

        (
            Self {
                writer,
                cell,
                timing,
                send_lock: tokio::sync::Mutex::new(()),
                shutdown,
                running,
                reader: Mutex::new(Some(handle)),
            },
            events_rx,
        )
    }

    /// True while the reader is alive.
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frames `payload` and sends it, retrying on NAK or silence.
    pub async fn send(&self, payload: &[u8], command: &str) -> Result<(), LinkError> {
        self.send_raw(&frame::build(payload), command).await
    }

    /// Sends the single-byte ENQ handshake.
    pub async fn send_handshake(&self, command: &str) -> Result<(), LinkError> {
        self.send_raw(&[ENQ], command).await
    }

    async fn send_raw(&self, bytes: &[u8], command: &str) -> Result<(), LinkError> {
        let _guard = self.send_lock.lock().await;
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        let attempts = self.timing.send_retries.max(1);
        for attempt in 1..=attempts {
            self.cell.reset();
            {
                let mut writer = self.writer.lock().expect("port mutex poisoned");
                writer.discard_input()?;
                log::debug!("write [{command}] {}", hex::encode(bytes));
                writer.write_all(bytes)?;
            }
            let timeout = Duration::from_millis(self.timing.send_timeout_ms);
            match self.cell.wait(timeout).await {
                Some(ACK) | Some(STX) => {
                    log::debug!("command {command} accepted on attempt {attempt}");
                    return Ok(());
                }
                Some(byte) => {
                    log::warn!(
                        "command {command} rejected with 0x{byte:02x} on attempt {attempt}"
                    );
                }
                None => {
                    log::warn!("command {command} timed out on attempt {attempt}");
                }
            }
        }
        Err(LinkError::Timeout { attempts })
    }

    /// Stops the reader and joins it. Idempotent; pending sends fail with
    /// [LinkError::Closed] afterwards.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.reader.lock().expect("reader mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ETX;
    use crate::packets::TransactionStatus;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Inbound half of the scripted link: bytes pushed by the test.
    struct ScriptReader {
        inbound: mpsc::Receiver<u8>,
        failed: Arc<AtomicBool>,
    }

    impl BytePort for ScriptReader {
        fn read_byte(&mut self) -> std::io::Result<u8> {
            if self.failed.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "link failed",
                ));
            }
            self.inbound
                .recv_timeout(Duration::from_millis(20))
                .map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "poll")
                    }
                    mpsc::RecvTimeoutError::Disconnected => {
                        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")
                    }
                })
        }

        fn write_all(&mut self, _: &[u8]) -> std::io::Result<()> {
            unreachable!("the reader half never writes")
        }

        fn discard_input(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Outbound half: records writes and feeds scripted responses back.
    struct ScriptWriter {
        inbound: mpsc::Sender<u8>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        responses: VecDeque<Vec<u8>>,
    }

    impl BytePort for ScriptWriter {
        fn read_byte(&mut self) -> std::io::Result<u8> {
            unreachable!("the writer half never reads")
        }

        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.writes.lock().unwrap().push(buf.to_vec());
            if let Some(response) = self.responses.pop_front() {
                for byte in response {
                    let _ = self.inbound.send(byte);
                }
            }
            Ok(())
        }

        fn discard_input(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Script {
        inbound: mpsc::Sender<u8>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        failed: Arc<AtomicBool>,
    }

    impl Script {
        fn feed(&self, bytes: &[u8]) {
            for &byte in bytes {
                self.inbound.send(byte).unwrap();
            }
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        /// Makes the next port read fail, as a dying serial device would.
        fn fail_link(&self) {
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    fn scripted(
        responses: Vec<Vec<u8>>,
    ) -> (Script, Box<dyn BytePort>, Box<dyn BytePort>) {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(AtomicBool::new(false));
        let reader = ScriptReader {
            inbound: inbound_rx,
            failed: Arc::clone(&failed),
        };
        let writer = ScriptWriter {
            inbound: inbound_tx.clone(),
            writes: Arc::clone(&writes),
            responses: responses.into(),
        };
        (
            Script {
                inbound: inbound_tx,
                writes,
                failed,
            },
            Box::new(reader),
            Box::new(writer),
        )
    }

    fn timing() -> LinkTiming {
        LinkTiming {
            ack_delay_ms: 1,
            send_timeout_ms: 100,
            send_retries: 3,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handshake_accepted() {
        let (_script, reader, writer) = scripted(vec![vec![ACK]]);
        let (transport, _events) = Transport::open(reader, writer, timing());
        transport.send_handshake("Test").await.unwrap();
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_retries_on_nak_then_ack() {
        let (script, reader, writer) = scripted(vec![vec![NAK], vec![NAK], vec![ACK]]);
        let (transport, _events) = Transport::open(reader, writer, timing());
        transport.send(b"72", "Abort").await.unwrap();
        assert_eq!(script.writes().len(), 3);
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_exhausts_attempts() {
        let (script, reader, writer) = scripted(vec![vec![NAK], vec![NAK], vec![NAK]]);
        let (transport, _events) = Transport::open(reader, writer, timing());
        let error = transport.send(b"72", "Abort").await.unwrap_err();
        assert!(matches!(error, LinkError::Timeout { attempts: 3 }));
        assert_eq!(script.writes().len(), 3);
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_timeout_without_any_response() {
        let (script, reader, writer) = scripted(vec![]);
        let (transport, _events) = Transport::open(reader, writer, timing());
        let error = transport.send(b"72", "Abort").await.unwrap_err();
        assert!(matches!(error, LinkError::Timeout { attempts: 3 }));
        assert_eq!(script.writes().len(), 3);
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inbound_frame_is_acked_and_dispatched() {
        let (script, reader, writer) = scripted(vec![]);
        let (transport, mut events) = Transport::open(reader, writer, timing());
        script.feed(&frame::build(b"2A000000042"));

        let event = events.recv().await.unwrap();
        let LinkEvent::Message(Message::Status(status)) = event else {
            panic!("expected a status message, got {event:?}");
        };
        assert_eq!(
            status,
            TransactionStatus {
                phase: 'A',
                result_code: "0000".to_string(),
                info: "00042".to_string(),
            }
        );
        // The part got acknowledged.
        assert_eq!(script.writes(), vec![vec![ACK]]);
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_lrc_recovery_emits_single_event() {
        let (script, reader, writer) = scripted(vec![]);
        let (transport, mut events) = Transport::open(reader, writer, timing());

        let good = frame::build(b"2A000000042");
        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 0x55;
        script.feed(&bad);
        script.feed(&good);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Message(Message::Status(_))));
        // NAK for the broken part, ACK for the retransmission; exactly one
        // message came out.
        assert_eq!(script.writes(), vec![vec![NAK], vec![ACK]]);
        assert!(events.try_recv().is_err());
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_multi_part_frame_acks_every_part() {
        let (script, reader, writer) = scripted(vec![]);
        let (transport, mut events) = Transport::open(reader, writer, timing());

        let payload = b"2A000000042".to_vec();
        let (head, tail) = payload.split_at(4);
        let mut first = head.to_vec();
        first.push(crate::constants::ETB);
        script.feed(&frame::build(&first));
        script.feed(&frame::build(tail));

        let event = events.recv().await.unwrap();
        let LinkEvent::Message(Message::Status(status)) = event else {
            panic!("expected a status message, got {event:?}");
        };
        assert_eq!(status.info, "00042");
        assert_eq!(script.writes(), vec![vec![ACK], vec![ACK]]);
        transport.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reader_exit_reports_closed() {
        let (script, reader, writer) = scripted(vec![]);
        let (transport, mut events) = Transport::open(reader, writer, timing());
        script.fail_link();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Closed { error: Some(_) }));
        assert!(!transport.is_open());
        let error = transport.send(b"72", "Abort").await.unwrap_err();
        assert!(matches!(error, LinkError::Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stray_bytes_are_ignored() {
        let (script, reader, writer) = scripted(vec![]);
        let (transport, mut events) = Transport::open(reader, writer, timing());
        script.feed(&[0x00, b'x', ETX, 0x7f]);
        script.feed(&frame::build(b"W"));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Message(Message::Wakeup(_))));
        transport.close();
    }
}
