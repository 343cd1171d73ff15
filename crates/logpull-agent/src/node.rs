//! Agent supervisor: connect, serve, reconnect.

use std::sync::Arc;

use logpull_transfer::{PeerLink, ProgressObserver, Signal};

use crate::artifact::ArtifactSource;
use crate::config::AgentConfig;
use crate::session::{AgentSession, SessionEnd};

/// Long-running agent process.
///
/// Keeps exactly one link to the hub. Whenever a session ends, cleanly or
/// not, the link is closed and a fresh connection is made after the
/// configured delay.
pub struct AgentNode {
    config: AgentConfig,
    source: Arc<dyn ArtifactSource>,
    observer: Arc<dyn ProgressObserver>,
    shutdown: Arc<Signal>,
}

impl AgentNode {
    pub fn new(
        config: AgentConfig,
        source: Arc<dyn ArtifactSource>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            config,
            source,
            observer,
            shutdown: Arc::new(Signal::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Handle that stops [`run`](Self::run) when set.
    pub fn shutdown_handle(&self) -> Arc<Signal> {
        Arc::clone(&self.shutdown)
    }

    /// Run until the shutdown signal is set.
    pub async fn run(&self) {
        let hub = self.config.hub_addr();
        let delay = self.config.reconnect_delay();
        let mut sessions: u64 = 0;

        tracing::info!(
            "Agent starting: hub={}, bind_ip={:?}, probe every {:?}",
            hub,
            self.config.bind_ip,
            self.config.probe_interval()
        );

        loop {
            let mut link = tokio::select! {
                link = PeerLink::connect_with_retry(hub, self.config.bind_ip, delay) => link,
                _ = self.shutdown.wait() => break,
            };
            sessions += 1;

            let outcome = {
                let mut session = AgentSession::new(
                    &mut link,
                    Arc::clone(&self.source),
                    Arc::clone(&self.observer),
                    self.config.probe_interval(),
                );
                tokio::select! {
                    outcome = session.serve() => Some(outcome),
                    _ = self.shutdown.wait() => None,
                }
            };

            match outcome {
                Some(Ok(SessionEnd::Finished(token))) => {
                    tracing::info!("Session {} finished by hub ({:?})", sessions, token);
                }
                Some(Err(e)) => {
                    tracing::warn!("Session {} ended: {}", sessions, e);
                }
                None => {
                    link.close();
                    break;
                }
            }

            link.close();
            tracing::info!("Reconnecting to {} in {:?}", hub, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.wait() => break,
            }
        }

        tracing::info!("Agent stopped after {} session(s)", sessions);
    }
}
