//! Transport seam for compressed mcu commands.
//!
//! The compression core produces framed command payloads ordered by
//! clock. Everything past that point (framing bytes, retransmits, the
//! serial port itself) belongs to the transport implementation behind
//! the [`Transport`] trait.

use thiserror::Error;

/// Error reported by a transport backend while handing off a batch.
#[derive(Debug, Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// A wire-framed mcu command awaiting transmission.
///
/// `min_clock` is overloaded the way the mcu host protocol expects:
/// while the message sits in a stepper's queue a nonzero value is the
/// clock at which the command's move-queue slot frees up; once the
/// synchronizer schedules the message it is rewritten to the earliest
/// allowed transmit time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u32>,
    pub min_clock: u64,
    pub req_clock: u64,
}

impl Message {
    /// Frame a raw command word array. Both clocks start at zero.
    pub fn encode(data: &[u32]) -> Self {
        Message {
            payload: data.to_vec(),
            min_clock: 0,
            req_clock: 0,
        }
    }
}

/// Groups commands that must stay ordered on one serial link. Freed by
/// `Drop`.
#[derive(Debug)]
pub struct CommandQueue {
    #[allow(dead_code)]
    pub(crate) id: usize,
}

/// Downstream half of the core: consumes ordered command batches.
pub trait Transport {
    fn alloc_command_queue(&mut self) -> CommandQueue;
    fn send_batch(
        &mut self,
        cq: &mut CommandQueue,
        msgs: Vec<Message>,
    ) -> Result<(), TransportError>;
}

/// In-memory transport capturing every batch, for tests and offline
/// analysis.
#[derive(Default, Debug)]
pub struct RecordingTransport {
    next_queue_id: usize,
    pub batches: Vec<Vec<Message>>,
}

impl RecordingTransport {
    /// All captured messages in transmit order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.batches.iter().flatten()
    }
}

impl Transport for RecordingTransport {
    fn alloc_command_queue(&mut self) -> CommandQueue {
        let id = self.next_queue_id;
        self.next_queue_id += 1;
        CommandQueue { id }
    }

    fn send_batch(
        &mut self,
        _cq: &mut CommandQueue,
        msgs: Vec<Message>,
    ) -> Result<(), TransportError> {
        self.batches.push(msgs);
        Ok(())
    }
}
