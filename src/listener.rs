//! The well-known-port accept loop.
//!
//! The listener reads one datagram at a time, validates it as an octet-mode
//! RRQ or WRQ, and hands it to a freshly spawned session. It never waits on
//! a transfer; all data flows over the session's own endpoint.

use crate::session;
use crate::store::FileStore;
use crate::tftp::{ErrorCode, Packet, TftpResult, TftpSocket};
use crate::txlog::{TxnKind, TxnLog, TxnRecord};
use std::io;
use std::net::SocketAddr;
use tokio::sync::watch;

/// Request read buffer size. Requests are tiny; anything beyond this is
/// not worth reading.
const REQUEST_BUFFER_SIZE: usize = 2048;

pub struct Server {
    sock: TftpSocket,
    store: FileStore,
    txns: TxnLog,
}

impl Server {
    pub fn bind(addr: SocketAddr, store: FileStore, txns: TxnLog) -> TftpResult<Server> {
        Ok(Server {
            sock: TftpSocket::bind(addr)?,
            store,
            txns,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Accepts requests until the shutdown flag flips (or its sender goes
    /// away). Every received datagram consumes one transaction id, valid
    /// or not.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; REQUEST_BUFFER_SIZE];
        let mut tx_id: u64 = 0;

        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = self.sock.recv_from(&mut buf) => read,
            };

            match read {
                Ok((len, addr)) => {
                    // The session gets its own copy; the next read reuses
                    // this buffer.
                    let datagram = buf[..len].to_vec();
                    self.dispatch(&datagram, addr, tx_id).await;
                }
                Err(e) => {
                    log::error!("unable to read packet from connection: {e}");
                    self.txns.record(TxnRecord::failure(
                        tx_id,
                        TxnKind::Unknown,
                        "initial packet unreadable",
                    ));
                }
            }
            tx_id += 1;
        }

        log::info!("listener stopped accepting requests");
    }

    async fn dispatch(&self, datagram: &[u8], addr: SocketAddr, tx_id: u64) {
        let packet = match Packet::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("tx #{tx_id}: incorrectly formatted packet from {addr}: {e}");
                self.reject(addr, "Malformed packet", tx_id, "initial packet corrupted")
                    .await;
                return;
            }
        };

        let (filename, mode, write) = match packet {
            Packet::ReadReq { filename, mode } => (filename, mode, false),
            Packet::WriteReq { filename, mode } => (filename, mode, true),
            other => {
                log::warn!("tx #{tx_id}: initial packet from {addr} was {other:?}");
                self.reject(
                    addr,
                    "Was expecting RRQ or WRQ packet",
                    tx_id,
                    "initial packet not RRQ or WRQ",
                )
                .await;
                return;
            }
        };

        if !mode.eq_ignore_ascii_case("octet") {
            log::warn!("tx #{tx_id}: {addr} requested unsupported mode '{mode}'");
            self.reject(
                addr,
                "This server only supports a mode of OCTET",
                tx_id,
                "communication not in OCTET mode",
            )
            .await;
            return;
        }

        let store = self.store.clone();
        let txns = self.txns.clone();
        if write {
            tokio::spawn(session::run_write(filename, addr, tx_id, store, txns));
        } else {
            tokio::spawn(session::run_read(filename, addr, tx_id, store, txns));
        }
    }

    /// Answers an unusable initial packet on the listener's own endpoint
    /// and records the failed transaction.
    async fn reject(&self, addr: SocketAddr, message: &str, tx_id: u64, notes: &'static str) {
        let error = Packet::Error {
            code: ErrorCode::Undefined,
            message: message.to_string(),
        };
        if let Err(e) = self.sock.send(&error, addr).await {
            log::warn!("unable to send rejection to {addr}: {e}");
        }
        self.txns
            .record(TxnRecord::failure(tx_id, TxnKind::Unknown, notes));
    }
}
