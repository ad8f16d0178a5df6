// An in-memory TFTP server compliant with the RFC 1350 core, octet mode
// only.
//
// A transfer begins with a request to read or write a file arriving on the
// well-known port. Each granted request gets its own session on a freshly
// bound ephemeral port (the server's TID for that transfer); file contents
// move in 512-byte DATA blocks, each acknowledged before the next is sent,
// and a block shorter than 512 bytes marks the end. The loser of any race
// is a timeout: whoever is waiting rebroadcasts its last packet, and a
// session that hears nothing for long enough gives up.
//
// Instead of a filesystem, contents live in a shared in-memory store seeded
// with one file, so a write can be read back for as long as the process
// lives. Every dispatched request — served or rejected — leaves exactly one
// line in the transaction log.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use memtftp::listener::Server;
use memtftp::store::FileStore;
use memtftp::txlog::{self, TXN_LOG_FILENAME};

/// The well-known TFTP port. Pass an alternative (9010 is the development
/// convention) as the first argument; binding 69 needs privileges.
const DEFAULT_PORT: u16 = 69;

/// The transaction log lives in the same directory as the running
/// executable.
fn txn_log_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("unable to find path to running executable")?;
    match exe.parent() {
        Some(dir) => Ok(dir.join(TXN_LOG_FILENAME)),
        None => Ok(PathBuf::from(TXN_LOG_FILENAME)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let port = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid port argument '{raw}'"))?,
        None => DEFAULT_PORT,
    };

    let store = FileStore::new();

    let txn_path = txn_log_path()?;
    let txn_file = tokio::fs::File::create(&txn_path)
        .await
        .with_context(|| format!("unable to create transaction log at {}", txn_path.display()))?;
    let (txns, _writer) = txlog::spawn_writer(txn_file);

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    let server = Server::bind(addr, store.clone(), txns)
        .with_context(|| format!("unable to bind server socket on {addr}"))?;
    log::info!("listening on {}", server.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt()).context("unable to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("unable to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        log::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await;

    // In-flight transfers finish or time out on their own; nothing is
    // cancelled here.
    println!("Full list of files in memory at server quit:");
    for filename in store.list() {
        println!("filename: {filename}");
    }

    Ok(())
}
