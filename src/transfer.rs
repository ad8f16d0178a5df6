//! Per-transfer protocol state machines.
//!
//! These are deliberately socket-free: a transfer consumes the peer's
//! packets one at a time and answers with a [`Step`] telling the session
//! loop what to put on the wire. All of the awkward protocol corners live
//! here (stale and future ACKs, duplicate DATA blocks, EOF by short block),
//! where they can be exercised without a network.

use crate::tftp::{ErrorCode, Packet, BLOCK_SIZE};

/// The action a session should take after feeding a packet to a transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Send the packet and wait for the peer's next packet.
    Reply(Packet),

    /// Keep waiting without sending anything new.
    Await,

    /// Send the packet; the transfer is then complete.
    Finish(Packet),

    /// The transfer is complete with nothing further to send.
    Done,

    /// Send the error packet and abort; the second field is the note for
    /// the transaction log.
    Abort(Packet, &'static str),
}

fn abort(message: &str, notes: &'static str) -> Step {
    Step::Abort(
        Packet::Error {
            code: ErrorCode::Undefined,
            message: message.to_string(),
        },
        notes,
    )
}

/// One in-flight transfer, read or write.
#[derive(Debug)]
pub enum Transfer {
    Read(ReadTransfer),
    Write(WriteTransfer),
}

impl Transfer {
    pub fn step(&mut self, packet: &Packet) -> Step {
        match self {
            Transfer::Read(t) => t.process_ack(packet),
            Transfer::Write(t) => t.process_data(packet),
        }
    }

    /// The accumulated contents of a finished write, ready for the store.
    pub fn into_write_contents(self) -> Option<Vec<u8>> {
        match self {
            Transfer::Write(t) => Some(t.contents),
            Transfer::Read(_) => None,
        }
    }
}

/// Serves a snapshot of file content as DATA blocks 1, 2, 3, … and
/// classifies the ACKs coming back.
#[derive(Debug)]
pub struct ReadTransfer {
    content: Vec<u8>,
    offset: usize,

    /// Block number of the DATA most recently sent.
    block: u16,

    /// The chunk just sent was shorter than a full block, so its ACK ends
    /// the transfer.
    final_sent: bool,
}

impl ReadTransfer {
    /// Starts a read over `content`, returning the transfer and the first
    /// DATA packet to send.
    pub fn begin(content: Vec<u8>) -> (Transfer, Packet) {
        let mut transfer = ReadTransfer {
            content,
            offset: 0,
            block: 0,
            final_sent: false,
        };
        let first = transfer.next_data();
        (Transfer::Read(transfer), first)
    }

    /// Carves the next chunk out of the content. A file whose length is a
    /// multiple of the block size ends with an empty DATA packet.
    fn next_data(&mut self) -> Packet {
        let end = (self.offset + BLOCK_SIZE).min(self.content.len());
        let chunk = self.content[self.offset..end].to_vec();
        self.offset = end;
        self.block = self.block.wrapping_add(1);
        self.final_sent = chunk.len() < BLOCK_SIZE;
        Packet::Data {
            block: self.block,
            data: chunk,
        }
    }

    fn process_ack(&mut self, packet: &Packet) -> Step {
        match packet {
            Packet::Ack { block } => match *block {
                b if b == self.block => {
                    if self.final_sent {
                        Step::Done
                    } else {
                        Step::Reply(self.next_data())
                    }
                }
                // A retransmit of an old ack; keep waiting for the real one.
                b if b < self.block => Step::Await,
                _ => abort(
                    "Received ACK for packet not yet sent.",
                    "received ACK for a block not yet sent",
                ),
            },
            _ => abort("Was expecting ACK packet", "received unexpected packet type"),
        }
    }
}

/// Accumulates DATA blocks into a buffer, acking each one. The block number
/// must advance by exactly one; an exact duplicate of the last block is
/// re-acked without appending.
#[derive(Debug)]
pub struct WriteTransfer {
    contents: Vec<u8>,

    /// Block number last acknowledged; 0 until the first DATA arrives.
    block: u16,
}

impl WriteTransfer {
    /// Starts a write, returning the transfer and the ACK(0) that grants
    /// the request.
    pub fn begin() -> (Transfer, Packet) {
        (
            Transfer::Write(WriteTransfer {
                contents: Vec::new(),
                block: 0,
            }),
            Packet::Ack { block: 0 },
        )
    }

    fn process_data(&mut self, packet: &Packet) -> Step {
        match packet {
            Packet::Data { block, data } => match *block {
                b if b == self.block.wrapping_add(1) => {
                    self.contents.extend_from_slice(data);
                    self.block = b;
                    let ack = Packet::Ack { block: b };
                    if data.len() < BLOCK_SIZE {
                        Step::Finish(ack)
                    } else {
                        Step::Reply(ack)
                    }
                }
                // Duplicated in transit; our ack was probably lost.
                b if b == self.block => Step::Reply(Packet::Ack { block: b }),
                _ => abort(
                    "Received DATA block out of sequence.",
                    "received DATA block out of sequence",
                ),
            },
            _ => abort("Was expecting DATA packet", "received unexpected packet type"),
        }
    }
}
