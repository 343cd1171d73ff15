//! Request fan-out across selected agents.
//!
//! A round is the set of agents selected by one or more `request_from`
//! calls that overlap in time. Every worker counts itself finished under the
//! round lock; the worker that brings the count up to the selection size
//! clears the selection and resets the count.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use logpull_transfer::{Signal, TransferReport};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::context::{HubContext, HubEvent, HubSessionState, StatusLevel};
use crate::error::{Error, Result};
use crate::registry::{ClientRegistry, ClientSession};
use crate::session;

/// Snapshot of the current request round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    /// Agents in the round still being counted
    pub selected: Vec<IpAddr>,
    /// Workers finished in the current round
    pub completed: usize,
    /// Rounds that ran to completion since start
    pub rounds_finished: u64,
    /// Size of the most recently finished round
    pub last_round_size: usize,
}

#[derive(Debug, Default)]
struct Round {
    selected: Vec<IpAddr>,
    completed: usize,
    rounds_finished: u64,
    last_round_size: usize,
}

impl Round {
    fn status(&self) -> RoundStatus {
        RoundStatus {
            selected: self.selected.clone(),
            completed: self.completed,
            rounds_finished: self.rounds_finished,
            last_round_size: self.last_round_size,
        }
    }
}

/// Why a selected agent got no worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotConnected,
    Dead,
    Busy,
}

/// Workers spawned by one [`Orchestrator::request_from`] call.
#[derive(Debug)]
pub struct RequestRound {
    pub started: Vec<IpAddr>,
    pub skipped: Vec<(IpAddr, SkipReason)>,
    workers: Vec<(IpAddr, JoinHandle<Result<TransferReport>>)>,
}

impl RequestRound {
    /// Wait for every worker. Workers keep running if this is never called.
    pub async fn join(self) -> Vec<(IpAddr, Result<TransferReport>)> {
        let (identities, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        let results = join_all(handles).await;

        identities
            .into_iter()
            .zip(results)
            .map(|(identity, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(Error::Io(std::io::Error::other(format!("worker panicked: {}", e))))
                });
                (identity, result)
            })
            .collect()
    }
}

/// Issues requests to agents and aggregates their completion.
#[derive(Debug)]
pub struct Orchestrator {
    registry: Arc<ClientRegistry>,
    context: HubContext,
    save_dir: PathBuf,
    round: Arc<Mutex<Round>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ClientRegistry>,
        context: HubContext,
        save_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            context,
            save_dir: save_dir.into(),
            round: Arc::new(Mutex::new(Round::default())),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Pull logs from each selected agent on its own worker.
    ///
    /// Dead agents are evicted and skipped, busy ones skipped.
    pub async fn request_from(&self, identities: &[IpAddr]) -> RequestRound {
        let mut claimed: Vec<Arc<ClientSession>> = Vec::new();
        let mut skipped = Vec::new();

        for &identity in identities {
            if claimed.iter().any(|s| s.identity() == identity) {
                continue;
            }
            let Some(session) = self.registry.get(identity).await else {
                skipped.push((identity, SkipReason::NotConnected));
                continue;
            };
            if !session.probe_alive() {
                tracing::warn!("{} failed the liveness check, evicting", identity);
                self.registry.unregister(identity, "failed liveness check").await;
                skipped.push((identity, SkipReason::Dead));
                continue;
            }
            if !session.try_claim() {
                skipped.push((identity, SkipReason::Busy));
                continue;
            }
            claimed.push(session);
        }

        let started: Vec<IpAddr> = claimed.iter().map(|s| s.identity()).collect();
        if !started.is_empty() {
            let mut round = self.round.lock().await;
            round.selected.extend(started.iter().copied());
            tracing::info!(
                "Requesting logs from {} client(s), {} in round",
                started.len(),
                round.selected.len()
            );
        }

        let workers = claimed
            .into_iter()
            .map(|session| {
                let identity = session.identity();
                let worker = Worker {
                    session,
                    save_dir: self.save_dir.clone(),
                    context: self.context.clone(),
                    round: Arc::clone(&self.round),
                };
                (identity, tokio::spawn(worker.run()))
            })
            .collect();

        RequestRound {
            started,
            skipped,
            workers,
        }
    }

    /// Send a `CheckStatus` keepalive to one agent.
    pub async fn check_status(&self, identity: IpAddr) -> Result<()> {
        let session = self
            .registry
            .get(identity)
            .await
            .ok_or(Error::UnknownClient(identity))?;

        let result = session::check_status(&session).await;
        if let Err(Error::Transfer(e)) = &result {
            tracing::warn!("CheckStatus to {} failed: {}", identity, e);
            self.registry.unregister(identity, "keepalive failed").await;
        }
        result
    }

    pub async fn round_status(&self) -> RoundStatus {
        self.round.lock().await.status()
    }
}

struct Worker {
    session: Arc<ClientSession>,
    save_dir: PathBuf,
    context: HubContext,
    round: Arc<Mutex<Round>>,
}

impl Worker {
    async fn run(self) -> Result<TransferReport> {
        let identity = self.session.identity();
        let completion = Signal::new();

        let result =
            session::request_logs(&self.session, &self.save_dir, &self.context, &completion).await;
        match &result {
            Ok(report) => {
                completion.wait().await;
                self.context.publish(HubEvent::TransferCompleted {
                    identity,
                    report: report.clone(),
                });
            }
            Err(e) => {
                self.context.publish(HubEvent::TransferFailed {
                    identity,
                    error: e.to_string(),
                });
            }
        }

        self.session.set_state(HubSessionState::Idle);
        self.session.release();
        self.finish().await;

        result
    }

    async fn finish(&self) {
        let mut round = self.round.lock().await;
        round.completed += 1;

        if round.completed >= round.selected.len() {
            let size = round.selected.len();
            round.selected.clear();
            round.completed = 0;
            round.rounds_finished += 1;
            round.last_round_size = size;
            drop(round);

            tracing::info!("All {} requested transfer(s) finished", size);
            self.context
                .status(StatusLevel::Info, format!("Round complete: {} client(s)", size));
        }
    }
}
