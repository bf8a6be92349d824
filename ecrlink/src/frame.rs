//! Byte-level framing: LRC, STX/ETX frames and multi-part reassembly.

use crate::constants::{ETB, ETX, STX};

/// XOR-reduces `bytes`. The wire LRC of a part is the XOR of everything
/// between STX and ETX, ETX included.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Wraps `payload` as `STX · payload · ETX · LRC`.
///
/// The host only ever emits single-part frames; splitting a payload over
/// ETB-continued parts is a terminal-side affair.
pub fn build(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(STX);
    frame.extend_from_slice(payload);
    frame.push(ETX);
    frame.push(lrc(&frame[1..]));
    frame
}

/// Outcome of feeding one in-frame byte to the assembler.
#[derive(Debug, PartialEq)]
pub enum FrameEvent {
    /// A part arrived with a valid LRC and deserves an ACK. `payload` is the
    /// reassembled logical payload once the final part is in, [None] while
    /// the terminal announced continuation via ETB.
    Part { payload: Option<Vec<u8>> },
    /// LRC mismatch. The current part was discarded; answer with NAK. Parts
    /// already acknowledged are kept, the terminal retransmits only the bad
    /// one.
    BadLrc,
}

#[derive(Debug)]
enum State {
    Idle,
    Body,
    Lrc,
}

/// Reassembles `STX…ETB`-continued parts into one logical payload.
///
/// The reader owns byte classification outside a frame; it calls
/// [FrameAssembler::start_part] on STX and [FrameAssembler::feed] for every
/// byte while [FrameAssembler::in_frame] holds.
#[derive(Debug)]
pub struct FrameAssembler {
    state: State,
    part: Vec<u8>,
    payload: Vec<u8>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            part: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// True between an STX and the trailing LRC byte of a part.
    pub fn in_frame(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Begins a new part.
    pub fn start_part(&mut self) {
        self.state = State::Body;
        self.part.clear();
    }

    /// Feeds one in-frame byte.
    pub fn feed(&mut self, byte: u8) -> Option<FrameEvent> {
        match self.state {
            State::Idle => None,
            State::Body => {
                if byte == ETX {
                    self.state = State::Lrc;
                } else {
                    self.part.push(byte);
                }
                None
            }
            State::Lrc => {
                self.state = State::Idle;
                if byte != lrc(&self.part) ^ ETX {
                    self.part.clear();
                    return Some(FrameEvent::BadLrc);
                }
                let more = self.part.last() == Some(&ETB);
                if more {
                    self.part.pop();
                }
                self.payload.append(&mut self.part);
                if more {
                    Some(FrameEvent::Part { payload: None })
                } else {
                    Some(FrameEvent::Part {
                        payload: Some(std::mem::take(&mut self.payload)),
                    })
                }
            }
        }
    }
}
