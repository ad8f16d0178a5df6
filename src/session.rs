//! Per-transfer sessions.
//!
//! A session owns a freshly-bound ephemeral UDP endpoint — the server-side
//! TID — for the lifetime of one transfer. The client address from the
//! initial request is the remote TID and never changes; anything arriving
//! from elsewhere is answered with an error and otherwise ignored. Loss
//! recovery is stop-and-wait: on a receive timeout the last packet sent is
//! rebroadcast, up to a fixed budget of attempts.

use crate::store::FileStore;
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use crate::transfer::{ReadTransfer, Step, Transfer, WriteTransfer};
use crate::txlog::{TxnKind, TxnLog, TxnRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// First port of the IANA-recommended ephemeral range.
const EPHEMERAL_PORT_START: u16 = 49152;

/// Size of the ephemeral range.
const EPHEMERAL_PORT_SPAN: u16 = 16383;

/// Attempts to find an unused ephemeral port before giving up.
const BIND_ATTEMPTS: u32 = 15;

/// Total receive attempts (each preceded by a retransmit after the first
/// timeout) before a transfer is abandoned.
const RETRY_BUDGET: u32 = 5;

/// Deadline for each receive attempt.
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the session endpoint on a randomly-picked ephemeral port.
///
/// The PRNG is seeded with the transaction id, so the sequence of attempted
/// ports is a pure function of the seed: equal ids pick the same first
/// port, distinct ids almost surely diverge.
pub fn bind_transfer_socket(tx_id: u64) -> Option<TftpSocket> {
    let mut rng = StdRng::seed_from_u64(tx_id);
    for attempts_left in (1..=BIND_ATTEMPTS).rev() {
        let port = EPHEMERAL_PORT_START + rng.gen_range(0..EPHEMERAL_PORT_SPAN);
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
            Ok(sock) => return Some(sock),
            Err(e) => {
                log::warn!("unable to bind to port {port}, {attempts_left} attempts left: {e}")
            }
        }
    }

    log::warn!("unable to select an ephemeral port at random");
    None
}

async fn send_error(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: &str) {
    // Error packets are a courtesy; nothing checks how they land.
    let _ = sock
        .send(
            &Packet::Error {
                code,
                message: message.to_string(),
            },
            dst,
        )
        .await;
}

#[derive(Debug)]
pub(crate) enum RecvError {
    /// The retry budget ran out without a reply from the peer.
    TimedOut,

    /// A datagram arrived from an address other than the transfer peer. It
    /// has been answered with an error; the transfer must not advance.
    Errant,

    /// The peer's datagram could not be decoded.
    Malformed(String),

    /// The session socket failed.
    IO(io::Error),
}

/// Waits for the next packet from `remote`, rebroadcasting `last_sent` on
/// each timeout. Datagrams from any other source get an unknown-TID error
/// on this same endpoint and surface as [`RecvError::Errant`] so the caller
/// can re-enter the receive with its state untouched.
pub(crate) async fn recv_expected(
    sock: &TftpSocket,
    remote: SocketAddr,
    last_sent: &Packet,
    per_attempt: Duration,
) -> Result<Packet, RecvError> {
    for _ in 0..RETRY_BUDGET {
        match sock.recv_with_timeout(per_attempt).await {
            Ok((bytes, src)) => {
                if src != remote {
                    log::info!("received a packet from unknown TID {src}");
                    send_error(sock, src, ErrorCode::Undefined, "TID is not known to this server")
                        .await;
                    return Err(RecvError::Errant);
                }
                return Packet::parse(&bytes).map_err(|e| RecvError::Malformed(e.to_string()));
            }
            Err(SocketError::Timeout(_)) => {
                log::info!("timed out waiting for {remote}, rebroadcasting last packet");
                let _ = sock.send(last_sent, remote).await;
            }
            Err(SocketError::IO(e)) => return Err(RecvError::IO(e)),
            Err(SocketError::PacketParse(e)) => return Err(RecvError::Malformed(e)),
        }
    }

    Err(RecvError::TimedOut)
}

/// Serves a validated read request: looks the file up, then streams DATA
/// blocks until the final short block is acknowledged.
pub async fn run_read(
    filename: String,
    remote: SocketAddr,
    tx_id: u64,
    store: FileStore,
    txns: TxnLog,
) {
    let sock = match bind_transfer_socket(tx_id) {
        Some(s) => s,
        None => {
            txns.record(TxnRecord::failure(
                tx_id,
                TxnKind::Read,
                "unable to open new TID connection",
            ));
            return;
        }
    };

    let content = match store.get(&filename) {
        Some(c) => c,
        None => {
            send_error(&sock, remote, ErrorCode::FileNotFound, "File not found").await;
            txns.record(TxnRecord::failure(
                tx_id,
                TxnKind::Read,
                "requested file not found",
            ));
            return;
        }
    };

    log::info!(
        "tx #{tx_id}: sending '{filename}' ({} bytes) to {remote}",
        content.len()
    );
    let (mut transfer, first) = ReadTransfer::begin(content);
    if drive(&sock, remote, &mut transfer, first, tx_id, TxnKind::Read, &txns).await {
        log::info!("tx #{tx_id}: read of '{filename}' complete");
        txns.record(TxnRecord::success(tx_id, TxnKind::Read));
    }
}

/// Serves a validated write request: grants it with ACK(0), accumulates
/// DATA blocks, and commits the result to the store once the final short
/// block has been acknowledged.
pub async fn run_write(
    filename: String,
    remote: SocketAddr,
    tx_id: u64,
    store: FileStore,
    txns: TxnLog,
) {
    let sock = match bind_transfer_socket(tx_id) {
        Some(s) => s,
        None => {
            txns.record(TxnRecord::failure(
                tx_id,
                TxnKind::Write,
                "unable to open new TID connection",
            ));
            return;
        }
    };

    log::info!("tx #{tx_id}: receiving '{filename}' from {remote}");
    let (mut transfer, grant) = WriteTransfer::begin();
    if drive(&sock, remote, &mut transfer, grant, tx_id, TxnKind::Write, &txns).await {
        if let Some(contents) = transfer.into_write_contents() {
            log::info!(
                "tx #{tx_id}: write of '{filename}' complete ({} bytes)",
                contents.len()
            );
            store.put(filename, contents);
        }
        txns.record(TxnRecord::success(tx_id, TxnKind::Write));
    }
}

/// The send/receive loop shared by both transfer kinds. Returns true when
/// the transfer completed; every failure path emits its own txn record
/// before returning false.
async fn drive(
    sock: &TftpSocket,
    remote: SocketAddr,
    transfer: &mut Transfer,
    first: Packet,
    tx_id: u64,
    kind: TxnKind,
    txns: &TxnLog,
) -> bool {
    let expected = match kind {
        TxnKind::Write => "DATA",
        _ => "ACK",
    };
    let mut out_packet = first;

    // The outer loop sends; the inner loop receives until the state
    // machine has something new to say.
    loop {
        if let Err(e) = sock.send(&out_packet, remote).await {
            log::warn!("tx #{tx_id}: unable to send packet: {e}");
            txns.record(TxnRecord::failure(tx_id, kind, "session socket send failed"));
            return false;
        }

        loop {
            let packet = match recv_expected(sock, remote, &out_packet, RECV_TIMEOUT).await {
                Ok(p) => p,
                Err(RecvError::Errant) => continue,
                Err(RecvError::TimedOut) => {
                    log::warn!("tx #{tx_id}: no reply from {remote}, giving up");
                    txns.record(TxnRecord::failure(
                        tx_id,
                        kind,
                        format!("timed out waiting for {expected} packet"),
                    ));
                    return false;
                }
                Err(RecvError::Malformed(e)) => {
                    log::warn!("tx #{tx_id}: malformed packet from {remote}: {e}");
                    send_error(sock, remote, ErrorCode::Undefined, "Malformed packet").await;
                    txns.record(TxnRecord::failure(tx_id, kind, "peer sent a malformed packet"));
                    return false;
                }
                Err(RecvError::IO(e)) => {
                    log::warn!("tx #{tx_id}: socket read failed: {e}");
                    txns.record(TxnRecord::failure(tx_id, kind, "session socket read failed"));
                    return false;
                }
            };

            match transfer.step(&packet) {
                Step::Reply(p) => {
                    out_packet = p;
                    break;
                }
                Step::Await => continue,
                Step::Finish(p) => {
                    let _ = sock.send(&p, remote).await;
                    return true;
                }
                Step::Done => return true,
                Step::Abort(p, notes) => {
                    log::warn!("tx #{tx_id}: aborting transfer with {remote}: {notes}");
                    let _ = sock.send(&p, remote).await;
                    txns.record(TxnRecord::failure(tx_id, kind, notes));
                    return false;
                }
            }
        }
    }
}
