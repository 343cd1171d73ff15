//! Agent side of the session protocol.
//!
//! ```text
//!            RequestLogs                 artifact built
//! Awaiting ─────────────► Building ─────────────────► Sending
//!   ▲  │                                                 │
//!   │  └── CheckStatus (wait again)                      │
//!   └────────────────────── transfer done ◄──────────────┘
//! ```
//!
//! Any other token ends the session. A fatal I/O error or a dead self-probe
//! surfaces as an error so the supervisor can rebuild the connection.

use std::sync::Arc;
use std::time::Duration;

use logpull_transfer::{streaming, Command, PeerLink, ProgressObserver, TransferReport};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::artifact::{Artifact, ArtifactSource};
use crate::error::{Error, Result};

/// Times the artifact is rebuilt when it is missing at send time.
pub const MAX_BUILD_ATTEMPTS: u32 = 3;

/// Where the agent is in its command loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    AwaitingCommand,
    Building,
    Sending,
}

/// Why a session ended without an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The hub sent a token outside the vocabulary.
    Finished(String),
}

enum Next {
    Command(logpull_transfer::Result<Command>),
    Probe,
}

/// Command loop over one connected link.
pub struct AgentSession<'a> {
    link: &'a mut PeerLink,
    source: Arc<dyn ArtifactSource>,
    observer: Arc<dyn ProgressObserver>,
    probe_interval: Duration,
    state: AgentState,
    sent: u64,
}

impl<'a> AgentSession<'a> {
    pub fn new(
        link: &'a mut PeerLink,
        source: Arc<dyn ArtifactSource>,
        observer: Arc<dyn ProgressObserver>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            link,
            source,
            observer,
            probe_interval,
            state: AgentState::AwaitingCommand,
            sent: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Number of artifacts sent in this session.
    pub fn artifacts_sent(&self) -> u64 {
        self.sent
    }

    /// Serve commands until the hub ends the session or the link fails.
    pub async fn serve(&mut self) -> Result<SessionEnd> {
        let mut probe = interval_at(Instant::now() + self.probe_interval, self.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.state = AgentState::AwaitingCommand;

            let next = tokio::select! {
                command = self.link.recv_command() => Next::Command(command),
                _ = probe.tick() => Next::Probe,
            };

            match next {
                Next::Probe => {
                    if !self.link.probe_alive() {
                        tracing::warn!("Link to hub {} is dead", self.link.remote_addr());
                        self.link.fault();
                        return Err(Error::LinkLost);
                    }
                }
                Next::Command(command) => match command? {
                    Command::RequestLogs => {
                        tracing::info!("Logs requested by hub");
                        let report = self.send_logs().await?;
                        self.sent += 1;
                        tracing::info!(
                            "Logs sent to hub ({} bytes, {:.2} MiB)",
                            report.expected,
                            report.size_mib()
                        );
                    }
                    Command::CheckStatus => {
                        tracing::debug!("Status check from hub");
                    }
                    Command::Other(token) => {
                        tracing::info!("Hub ended the session: {:?}", token);
                        return Ok(SessionEnd::Finished(token));
                    }
                },
            }
        }
    }

    /// Build the artifact and stream it, rebuilding when it vanished in between.
    async fn send_logs(&mut self) -> Result<TransferReport> {
        let mut last_problem = String::new();

        for attempt in 1..=MAX_BUILD_ATTEMPTS {
            self.state = AgentState::Building;
            let artifact = match build_artifact(Arc::clone(&self.source)).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    tracing::warn!(
                        "Building logs failed (attempt {}/{}): {}",
                        attempt,
                        MAX_BUILD_ATTEMPTS,
                        e
                    );
                    last_problem = e.to_string();
                    continue;
                }
            };

            self.state = AgentState::Sending;
            let result = match self.link.stream() {
                Ok(stream) => {
                    streaming::send_artifact(stream, &artifact.path, self.observer.as_ref()).await
                }
                Err(e) => Err(e),
            };

            match self.link.track(result) {
                Ok(report) => {
                    self.cleanup().await;
                    return Ok(report);
                }
                Err(logpull_transfer::Error::ArtifactMissing(path)) => {
                    tracing::warn!(
                        "Log bundle {:?} missing at send time, rebuilding (attempt {}/{})",
                        path,
                        attempt,
                        MAX_BUILD_ATTEMPTS
                    );
                    last_problem = format!("{:?} missing", path);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::ArtifactUnavailable {
            attempts: MAX_BUILD_ATTEMPTS,
            reason: last_problem,
        })
    }

    async fn cleanup(&self) {
        let source = Arc::clone(&self.source);
        match tokio::task::spawn_blocking(move || source.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Removing staged logs failed: {}", e),
            Err(e) => tracing::warn!("Cleanup task failed: {}", e),
        }
    }
}

async fn build_artifact(source: Arc<dyn ArtifactSource>) -> std::io::Result<Artifact> {
    tokio::task::spawn_blocking(move || source.build())
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use logpull_transfer::{bind_listener, streaming::receive_file_info, ByteCounter, NoProgress};
    use tokio::io::AsyncReadExt;

    /// Long enough that no self-check fires during a test.
    const QUIET: Duration = Duration::from_secs(60);

    /// Writes a fixed payload; optionally deletes it right after building.
    struct FixedArtifact {
        dir: PathBuf,
        payload: Vec<u8>,
        builds: AtomicU32,
        vanish_first: u32,
        cleanups: AtomicU32,
    }

    impl FixedArtifact {
        fn new(dir: PathBuf, payload: Vec<u8>, vanish_first: u32) -> Self {
            Self {
                dir,
                payload,
                builds: AtomicU32::new(0),
                vanish_first,
                cleanups: AtomicU32::new(0),
            }
        }
    }

    impl ArtifactSource for FixedArtifact {
        fn build(&self) -> std::io::Result<Artifact> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            let path = self.dir.join("fixed.bin");
            std::fs::write(&path, &self.payload)?;
            if n <= self.vanish_first {
                std::fs::remove_file(&path)?;
            }
            Ok(Artifact {
                path,
                len: self.payload.len() as u64,
            })
        }

        fn cleanup(&self) -> std::io::Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn link_pair() -> (PeerLink, PeerLink) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let addr = listener.local_addr().unwrap();
        let (agent, accepted) = tokio::join!(PeerLink::connect(addr, None), listener.accept());
        (agent.unwrap(), PeerLink::from_stream(accepted.unwrap().0).unwrap())
    }

    #[tokio::test]
    async fn test_check_status_builds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedArtifact::new(dir.path().to_path_buf(), vec![1; 10], 0));
        let (mut agent, mut hub) = link_pair().await;

        let serving = {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                let observer = Arc::new(NoProgress);
                let mut session = AgentSession::new(&mut agent, source, observer, QUIET);
                session.serve().await
            })
        };

        hub.send_command(&Command::CheckStatus).await.unwrap();
        hub.send_command(&Command::CheckStatus).await.unwrap();
        hub.send_command(&Command::Other("Bye".into())).await.unwrap();

        let end = serving.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Finished("Bye".into()));
        assert_eq!(source.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_logs_streams_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..70_000u32).map(|i| i as u8).collect();
        let source = Arc::new(FixedArtifact::new(dir.path().to_path_buf(), payload.clone(), 0));
        let (mut agent, mut hub) = link_pair().await;
        let counter = Arc::new(ByteCounter::new());

        let serving = {
            let source = Arc::clone(&source);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut session = AgentSession::new(&mut agent, source, counter, QUIET);
                let end = session.serve().await;
                (end, session.artifacts_sent())
            })
        };

        hub.send_command(&Command::RequestLogs).await.unwrap();
        let stream = hub.stream().unwrap();
        let len = receive_file_info(stream).await.unwrap();
        let mut got = vec![0u8; len as usize];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);

        hub.send_command(&Command::Other("done".into())).await.unwrap();
        let (end, sent) = serving.await.unwrap();
        assert!(end.is_ok());
        assert_eq!(sent, 1);
        assert_eq!(counter.total(), payload.len() as u64);
        assert_eq!(source.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedArtifact::new(dir.path().to_path_buf(), vec![9; 32], 1));
        let (mut agent, mut hub) = link_pair().await;

        let serving = {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                let observer = Arc::new(NoProgress);
                let mut session = AgentSession::new(&mut agent, source, observer, QUIET);
                session.serve().await
            })
        };

        hub.send_command(&Command::RequestLogs).await.unwrap();
        let stream = hub.stream().unwrap();
        assert_eq!(receive_file_info(stream).await.unwrap(), 32);
        let mut got = [0u8; 32];
        stream.read_exact(&mut got).await.unwrap();

        hub.close();
        assert!(serving.await.unwrap().is_err());
        assert_eq!(source.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rebuild_attempts_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedArtifact::new(dir.path().to_path_buf(), vec![1; 8], u32::MAX));
        let (mut agent, mut hub) = link_pair().await;

        let serving = {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                let observer = Arc::new(NoProgress);
                let mut session = AgentSession::new(&mut agent, source, observer, QUIET);
                session.serve().await
            })
        };

        hub.send_command(&Command::RequestLogs).await.unwrap();
        let err = serving.await.unwrap().unwrap_err();

        assert!(matches!(err, Error::ArtifactUnavailable { attempts: MAX_BUILD_ATTEMPTS, .. }));
        assert_eq!(source.builds.load(Ordering::SeqCst), MAX_BUILD_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_probe_ticks_keep_idle_session() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedArtifact::new(dir.path().to_path_buf(), vec![], 0));
        let (mut agent, mut hub) = link_pair().await;

        let serving = tokio::spawn(async move {
            let period = Duration::from_millis(10);
            let mut session = AgentSession::new(&mut agent, source, Arc::new(NoProgress), period);
            session.serve().await
        });

        // Several probe ticks pass while the hub is silent
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!serving.is_finished());

        hub.send_command(&Command::Other("quit".into())).await.unwrap();
        let end = serving.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Finished("quit".into()));
    }

    #[tokio::test]
    async fn test_hub_close_ends_session_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedArtifact::new(dir.path().to_path_buf(), vec![], 0));
        let (mut agent, mut hub) = link_pair().await;

        let serving = tokio::spawn(async move {
            let period = Duration::from_millis(20);
            let mut session = AgentSession::new(&mut agent, source, Arc::new(NoProgress), period);
            session.serve().await
        });

        hub.close();
        let result = tokio::time::timeout(Duration::from_secs(2), serving).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Transfer(_)) | Err(Error::LinkLost)));
    }
}
