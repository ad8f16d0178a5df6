//! An in-memory TFTP server (RFC 1350, octet mode only).
//!
//! Files live in a process-local namespace: whatever a client writes can be
//! read back by later clients, and nothing survives the process. The crate
//! splits along the protocol's own seams: [`tftp`] is the wire codec and
//! socket wrapper, [`transfer`] the pure per-transfer state machines,
//! [`session`] the stop-and-wait loop that owns one ephemeral TID endpoint
//! per transfer, [`listener`] the well-known-port accept loop, [`store`]
//! the shared file namespace, and [`txlog`] the transaction audit trail.

pub mod listener;
pub mod session;
pub mod store;
pub mod tftp;
pub mod transfer;
pub mod txlog;
