//! Hub side of the session protocol.
//!
//! One exchange owns the session's link guard from the command send until
//! the last payload byte is on disk, so two transfers never share a link.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use logpull_transfer::{streaming, Command, Signal, TransferReport};

use crate::context::{HubContext, HubEvent, HubSessionState};
use crate::error::{Error, Result};
use crate::registry::ClientSession;

/// Extension of stored bundles.
pub const ARTIFACT_EXTENSION: &str = "bundle";

/// Destination of the artifact pulled from `identity` on `date`.
///
/// One file per agent per calendar day: `<save_dir>/<YYYY-MM-DD>_<ip>.bundle`.
pub fn artifact_path(save_dir: &Path, date: NaiveDate, identity: IpAddr) -> PathBuf {
    let ip = identity.to_string().replace(':', "-");
    save_dir.join(format!("{}_{}.{}", date.format("%Y-%m-%d"), ip, ARTIFACT_EXTENSION))
}

/// Create the save directory and clear today's previous artifact.
async fn prepare_destination(save_dir: &Path, identity: IpAddr) -> Result<PathBuf> {
    let destination = |source: std::io::Error| logpull_transfer::Error::Destination {
        path: save_dir.to_path_buf(),
        source,
    };

    tokio::fs::create_dir_all(save_dir).await.map_err(destination)?;

    let path = artifact_path(save_dir, Local::now().date_naive(), identity);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => tracing::debug!("Removed earlier artifact {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(destination(e).into()),
    }
    Ok(path)
}

/// Run one `RequestLogs` exchange and store the artifact.
///
/// `completion` is set once the artifact is written and closed. On failure
/// after the command went out the link is faulted, since unread payload
/// would desynchronise the next command.
pub async fn request_logs(
    session: &ClientSession,
    save_dir: &Path,
    context: &HubContext,
    completion: &Signal,
) -> Result<TransferReport> {
    let identity = session.identity();
    let mut link = session.link().lock().await;

    session.set_state(HubSessionState::Requested);
    link.send_command(&Command::RequestLogs).await?;

    let result = async {
        let stream = link.stream()?;
        let expected = streaming::receive_file_info(stream).await?;

        session.set_state(HubSessionState::Receiving);
        tracing::info!(
            "{} announced {} bytes ({:.2} MiB)",
            identity,
            expected,
            logpull_transfer::types::mib(expected)
        );
        context.publish(HubEvent::TransferStarted { identity, expected });

        let path = prepare_destination(save_dir, identity).await?;
        let progress = |bytes: u64| context.publish(HubEvent::Progress { identity, bytes });
        let report = streaming::receive(stream, expected, &path, &progress, completion).await?;
        Ok::<_, Error>(report)
    }
    .await;

    match result {
        Ok(report) => {
            session.set_state(HubSessionState::Done);
            Ok(report)
        }
        Err(e) => {
            link.fault();
            session.set_state(HubSessionState::Idle);
            Err(e)
        }
    }
}

/// Send the `CheckStatus` keepalive. Nothing is expected back.
pub async fn check_status(session: &ClientSession) -> Result<()> {
    if session.is_busy() {
        return Err(Error::Busy(session.identity()));
    }
    let mut link = session.link().lock().await;
    link.send_command(&Command::CheckStatus).await?;
    Ok(())
}
