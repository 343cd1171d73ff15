//! Unix socket server for admin commands.
//!
//! Provides a local IPC interface for listing agents, requesting logs and
//! restarting the agent listener.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::context::SessionInfo;
use crate::error::Result;
use crate::node::ListenerControl;
use crate::orchestrator::{Orchestrator, RoundStatus, SkipReason};

/// Admin command sent over the socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// List connected agents
    ListClients,
    /// Pull logs; an empty list selects every connected agent
    RequestLogs {
        #[serde(default)]
        clients: Vec<IpAddr>,
    },
    /// Send a keepalive to one agent
    CheckStatus { client: IpAddr },
    /// Current request round
    Status,
    /// Reload the config and rebind the agent listener
    RestartListener,
    /// Ping (health check)
    Ping,
}

/// Response from admin command.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    Clients { items: Vec<SessionInfo> },
    Requested {
        started: Vec<IpAddr>,
        skipped: Vec<(IpAddr, SkipReason)>,
    },
    Round { round: RoundStatus, clients: usize },
    Pong,
}

/// Admin socket server.
pub struct AdminSocket {
    orchestrator: Arc<Orchestrator>,
    listener: Option<Arc<ListenerControl>>,
    socket_path: PathBuf,
}

impl AdminSocket {
    /// Create a new admin socket server.
    pub fn new(orchestrator: Arc<Orchestrator>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            listener: None,
            socket_path: socket_path.into(),
        }
    }

    /// Enable `restart_listener`.
    pub fn with_listener_control(mut self, listener: Arc<ListenerControl>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Bind the socket, replacing a stale socket file.
    pub fn bind(&self) -> Result<UnixListener> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept admin connections forever.
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let listener = self.listener.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, orchestrator, listener).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
    listener: Option<Arc<ListenerControl>>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => execute_command(cmd, &orchestrator, listener.as_deref()).await,
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

async fn execute_command(
    cmd: AdminCommand,
    orchestrator: &Orchestrator,
    listener: Option<&ListenerControl>,
) -> AdminResponse {
    let registry = orchestrator.registry();

    match cmd {
        AdminCommand::ListClients => AdminResponse::Clients {
            items: registry.list().await,
        },

        AdminCommand::RequestLogs { clients } => {
            let targets = if clients.is_empty() {
                registry.list().await.into_iter().map(|i| i.identity).collect()
            } else {
                clients
            };
            if targets.is_empty() {
                return AdminResponse::Error {
                    error: "No clients connected".to_string(),
                };
            }

            // Workers run detached; progress shows up in the hub log
            let round = orchestrator.request_from(&targets).await;
            AdminResponse::Requested {
                started: round.started.clone(),
                skipped: round.skipped.clone(),
            }
        }

        AdminCommand::CheckStatus { client } => match orchestrator.check_status(client).await {
            Ok(()) => AdminResponse::Ok {
                message: format!("CheckStatus sent to {}", client),
            },
            Err(e) => AdminResponse::Error { error: e.to_string() },
        },

        AdminCommand::Status => AdminResponse::Round {
            round: orchestrator.round_status().await,
            clients: registry.len().await,
        },

        AdminCommand::RestartListener => {
            let Some(listener) = listener else {
                return AdminResponse::Error {
                    error: "Listener restart not available".to_string(),
                };
            };
            match listener.request_restart().await {
                Ok(addr) => AdminResponse::Ok {
                    message: format!("Listener restarting on {}", addr),
                },
                Err(e) => AdminResponse::Error { error: e.to_string() },
            }
        }

        AdminCommand::Ping => AdminResponse::Pong,
    }
}
