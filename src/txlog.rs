use std::fmt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Name of the transaction log file, created next to the running executable.
pub const TXN_LOG_FILENAME: &str = "tftpTxn.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Read,
    Write,
    /// The initial datagram never became a session.
    Unknown,
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxnKind::Read => write!(f, "READ"),
            TxnKind::Write => write!(f, "WRITE"),
            TxnKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Success,
    Failed,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxnStatus::Success => write!(f, "success"),
            TxnStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One line of the transaction log. Every dispatched session produces
/// exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRecord {
    pub tx_id: u64,
    pub kind: TxnKind,
    pub status: TxnStatus,
    pub notes: String,
}

impl TxnRecord {
    pub fn success(tx_id: u64, kind: TxnKind) -> TxnRecord {
        TxnRecord {
            tx_id,
            kind,
            status: TxnStatus::Success,
            notes: "<none>".to_string(),
        }
    }

    pub fn failure(tx_id: u64, kind: TxnKind, notes: impl Into<String>) -> TxnRecord {
        TxnRecord {
            tx_id,
            kind,
            status: TxnStatus::Failed,
            notes: notes.into(),
        }
    }
}

impl fmt::Display for TxnRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Transaction #{} of type {} completed with status {} and notes {}",
            self.tx_id, self.kind, self.status, self.notes
        )
    }
}

/// Producer handle to the transaction log. Cloned into the listener and
/// every session; sending never blocks the protocol path.
#[derive(Clone)]
pub struct TxnLog {
    tx: mpsc::UnboundedSender<TxnRecord>,
}

impl TxnLog {
    pub fn record(&self, record: TxnRecord) {
        if self.tx.send(record).is_err() {
            log::error!("transaction log writer is gone, record dropped");
        }
    }
}

/// Starts the single consumer that appends each record to `file` as one
/// line. Write failures are reported and swallowed; they never reach the
/// sessions producing records.
pub fn spawn_writer(mut file: tokio::fs::File) -> (TxnLog, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TxnRecord>();

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let line = format!("{record}\n");
            if let Err(e) = file.write_all(line.as_bytes()).await {
                log::error!("failed to log txn '{record}': {e}");
                continue;
            }
            if let Err(e) = file.flush().await {
                log::error!("failed to flush txn log: {e}");
            }
        }
    });

    (TxnLog { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_record_format() {
        assert_eq!(
            TxnRecord::success(3, TxnKind::Read).to_string(),
            "Transaction #3 of type READ completed with status success and notes <none>"
        );
        assert_eq!(
            TxnRecord::failure(0, TxnKind::Unknown, "initial packet corrupted").to_string(),
            "Transaction #0 of type unknown completed with status failed and notes \
             initial packet corrupted"
        );
        assert_eq!(
            TxnRecord::failure(12, TxnKind::Write, "unable to open new TID connection")
                .to_string(),
            "Transaction #12 of type WRITE completed with status failed and notes \
             unable to open new TID connection"
        );
    }

    #[tokio::test]
    async fn test_writer_appends_one_line_per_record() {
        let tmpdir = TempDir::new("txlog").unwrap();
        let path = tmpdir.path().join(TXN_LOG_FILENAME);
        let file = tokio::fs::File::create(&path).await.unwrap();

        let (txns, handle) = spawn_writer(file);
        txns.record(TxnRecord::success(0, TxnKind::Read));
        txns.record(TxnRecord::failure(1, TxnKind::Write, "requested file not found"));
        drop(txns);
        handle.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "Transaction #0 of type READ completed with status success and notes <none>"
        );
        assert_eq!(
            lines[1],
            "Transaction #1 of type WRITE completed with status failed and notes \
             requested file not found"
        );
    }
}
