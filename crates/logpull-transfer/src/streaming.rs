//! Length-prefixed artifact streaming
//!
//! Wire layout of one transfer:
//!
//! ```text
//! +----------------------+-------------------------------+
//! | length: u64 (LE, 8B) | payload: exactly `length` B   |
//! +----------------------+-------------------------------+
//! ```
//!
//! There is no end marker. Both sides move the payload in [`CHUNK_SIZE`]
//! pieces and report each piece to a [`ProgressObserver`], so the reported
//! increments of a successful transfer always sum to the announced length.
//! The receiver never reads past the declared length, which keeps the link
//! aligned for the next command frame.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::types::{TransferReport, CHUNK_SIZE, HEADER_LEN};

/// Receives byte-level progress for one transfer.
pub trait ProgressObserver: Send + Sync {
    /// Called once per chunk moved, with that chunk's size.
    fn on_bytes(&self, n: u64);
}

impl<F> ProgressObserver for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_bytes(&self, n: u64) {
        self(n)
    }
}

/// Observer that ignores progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_bytes(&self, _n: u64) {}
}

/// Observer that sums increments and counts calls.
#[derive(Debug, Default)]
pub struct ByteCounter {
    total: AtomicU64,
    calls: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all increments so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Number of observer invocations.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProgressObserver for ByteCounter {
    fn on_bytes(&self, n: u64) {
        self.total.fetch_add(n, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Encode a length header.
pub fn encode_header(len: u64) -> [u8; HEADER_LEN] {
    len.to_le_bytes()
}

/// Open the artifact and announce its length.
///
/// Fails with [`Error::ArtifactMissing`] before anything is written when the
/// file does not exist, so the caller can rebuild it and try again.
pub async fn send_file_info<W>(writer: &mut W, path: &Path) -> Result<(File, u64)>
where
    W: AsyncWrite + Unpin,
{
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ArtifactMissing(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();

    writer.write_all(&encode_header(len)).await?;
    writer.flush().await?;
    tracing::debug!("Announced artifact {:?} ({} bytes)", path, len);

    Ok((file, len))
}

/// Write a whole chunk, continuing after short writes.
async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0;
    while offset < chunk.len() {
        let sent = writer.write(&chunk[offset..]).await?;
        if sent == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        offset += sent;
    }
    Ok(())
}

/// Send header and payload of the artifact at `path`.
pub async fn send_artifact<W>(
    writer: &mut W,
    path: &Path,
    observer: &dyn ProgressObserver,
) -> Result<TransferReport>
where
    W: AsyncWrite + Unpin,
{
    let (mut file, len) = send_file_info(writer, path).await?;
    let mut buf = BytesMut::zeroed(CHUNK_SIZE.min(len as usize).max(1));
    let mut remaining = len;

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            // The file shrank underneath us
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("artifact {:?} ended {} bytes early", path, remaining),
            )
            .into());
        }

        write_chunk(writer, &buf[..read]).await?;
        observer.on_bytes(read as u64);
        remaining -= read as u64;
    }
    writer.flush().await?;

    Ok(TransferReport {
        expected: len,
        received: len,
        path: path.to_path_buf(),
    })
}

/// Read exactly the 8-byte length header.
pub async fn receive_file_info<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(Error::Truncated {
                what: "length header",
                got: filled,
                want: HEADER_LEN,
            });
        }
        filled += n;
    }

    Ok(u64::from_le_bytes(header))
}

/// Receive `expected` payload bytes into `dest`.
///
/// `completion` is set exactly once, after the destination is fully written
/// and closed. A zero-byte read before the end is reported as
/// [`Error::Disconnected`] and the partial file is removed.
pub async fn receive<R>(
    reader: &mut R,
    expected: u64,
    dest: &Path,
    observer: &dyn ProgressObserver,
    completion: &Signal,
) -> Result<TransferReport>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(dest).await.map_err(|source| Error::Destination {
        path: dest.to_path_buf(),
        source,
    })?;

    let outcome = receive_into(reader, &mut file, expected, dest, observer).await;
    let closed = file.flush().await;
    drop(file);

    let received = match (outcome, closed) {
        (Ok(received), Ok(())) => received,
        (Ok(_), Err(source)) => {
            discard_partial(dest).await;
            return Err(Error::Destination {
                path: dest.to_path_buf(),
                source,
            });
        }
        (Err(e), _) => {
            discard_partial(dest).await;
            return Err(e);
        }
    };

    completion.set();

    Ok(TransferReport {
        expected,
        received,
        path: dest.to_path_buf(),
    })
}

async fn receive_into<R>(
    reader: &mut R,
    file: &mut File,
    expected: u64,
    dest: &Path,
    observer: &dyn ProgressObserver,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(CHUNK_SIZE.min(expected as usize).max(1));
    let mut received: u64 = 0;

    while received < expected {
        let want = buf.len().min((expected - received) as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::Disconnected { expected, received });
        }

        file.write_all(&buf[..n]).await.map_err(|source| Error::Destination {
            path: dest.to_path_buf(),
            source,
        })?;
        observer.on_bytes(n as u64);
        received += n as u64;
    }

    Ok(received)
}

async fn discard_partial(dest: &Path) {
    if let Err(e) = tokio::fs::remove_file(dest).await {
        tracing::debug!("Could not remove partial artifact {:?}: {}", dest, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn round_trip(len: usize) -> (TransferReport, Vec<u8>, Vec<u8>, u64) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("logs.tar.zst");
        let dest = dir.path().join("received.bundle");
        let payload = pattern(len);
        tokio::fs::write(&src, &payload).await.unwrap();

        let (mut agent, mut hub) = tokio::io::duplex(64 * 1024);
        let sender = {
            let src = src.clone();
            tokio::spawn(async move { send_artifact(&mut agent, &src, &NoProgress).await })
        };

        let counter = ByteCounter::new();
        let completion = Signal::new();
        let expected = receive_file_info(&mut hub).await.unwrap();
        let report = receive(&mut hub, expected, &dest, &counter, &completion).await.unwrap();
        sender.await.unwrap().unwrap();

        assert!(completion.try_take());
        let got = tokio::fs::read(&dest).await.unwrap();
        (report, payload, got, counter.total())
    }

    #[test]
    fn test_header_is_little_endian() {
        assert_eq!(encode_header(1), [1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_header(12_582_912), 12_582_912u64.to_le_bytes());
    }

    #[tokio::test]
    async fn test_multi_chunk_transfer() {
        let len = 2 * CHUNK_SIZE + CHUNK_SIZE / 5;
        let (report, sent, got, progress) = round_trip(len).await;

        assert_eq!(report.expected, len as u64);
        assert_eq!(report.received, len as u64);
        assert_eq!(progress, len as u64);
        assert_eq!(sent, got);
    }

    #[tokio::test]
    async fn test_zero_length_transfer_completes() {
        let (report, _, got, progress) = round_trip(0).await;
        assert_eq!(report.expected, 0);
        assert_eq!(report.received, 0);
        assert_eq!(progress, 0);
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_sender_progress_sums_to_length() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        tokio::fs::write(&src, pattern(CHUNK_SIZE + 17)).await.unwrap();

        let (mut agent, mut hub) = tokio::io::duplex(1024 * 1024);
        let drain = tokio::spawn(async move {
            let mut sink = Vec::new();
            hub.read_to_end(&mut sink).await.unwrap();
            sink.len()
        });

        let counter = Arc::new(ByteCounter::new());
        let report = send_artifact(&mut agent, &src, counter.as_ref()).await.unwrap();
        drop(agent);

        assert_eq!(counter.total(), report.expected);
        assert_eq!(drain.await.unwrap() as u64, HEADER_LEN as u64 + report.expected);
    }

    #[tokio::test]
    async fn test_missing_artifact_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agent, mut hub) = tokio::io::duplex(1024);

        let err = send_artifact(&mut agent, &dir.path().join("gone.tar.zst"), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing(_)));

        drop(agent);
        let mut rest = Vec::new();
        hub.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_short_payload_is_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("short.bundle");
        let (mut agent, mut hub) = tokio::io::duplex(1024);

        agent.write_all(&encode_header(100)).await.unwrap();
        agent.write_all(&[7u8; 40]).await.unwrap();
        drop(agent);

        let completion = Signal::new();
        let expected = receive_file_info(&mut hub).await.unwrap();
        let err = receive(&mut hub, expected, &dest, &NoProgress, &completion)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Disconnected { expected: 100, received: 40 }));
        assert!(!completion.is_set());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let (mut agent, mut hub) = tokio::io::duplex(64);
        agent.write_all(&[1, 2, 3]).await.unwrap();
        drop(agent);

        let err = receive_file_info(&mut hub).await.unwrap_err();
        assert!(matches!(err, Error::Truncated { got: 3, want: 8, .. }));
    }

    #[tokio::test]
    async fn test_receiver_stops_at_declared_length() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("exact.bundle");
        let (mut agent, mut hub) = tokio::io::duplex(1024);

        agent.write_all(&encode_header(5)).await.unwrap();
        agent.write_all(b"helloRequestLogs").await.unwrap();

        let expected = receive_file_info(&mut hub).await.unwrap();
        receive(&mut hub, expected, &dest, &NoProgress, &Signal::new())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
        let mut next = [0u8; 11];
        hub.read_exact(&mut next).await.unwrap();
        assert_eq!(&next, b"RequestLogs");
    }

    #[tokio::test]
    async fn test_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing-dir").join("x.bundle");
        let (_agent, mut hub) = tokio::io::duplex(64);

        let err = receive(&mut hub, 10, &dest, &NoProgress, &Signal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Destination { .. }));
        assert!(!err.is_transient());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        #[test]
        fn prop_round_trip_preserves_bytes(len in 0usize..200_000) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (report, sent, got, progress) = rt.block_on(round_trip(len));

            proptest::prop_assert_eq!(report.received, len as u64);
            proptest::prop_assert_eq!(progress, len as u64);
            proptest::prop_assert_eq!(sent, got);
        }
    }
}
