//! logpull-admin CLI tool
//!
//! Talks to a running hub over its admin socket.
//!
//! Usage:
//!   logpull-admin list
//!   logpull-admin request-logs [ip...]
//!   logpull-admin check-status <ip>
//!   logpull-admin status
//!   logpull-admin restart
//!   logpull-admin ping

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// Admin command sent over the socket.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum AdminCommand {
    ListClients,
    RequestLogs { clients: Vec<IpAddr> },
    CheckStatus { client: IpAddr },
    Status,
    RestartListener,
    Ping,
}

#[derive(Debug, Deserialize)]
struct ClientEntry {
    identity: IpAddr,
    host_name: String,
    state: String,
    busy: bool,
    connected_at: String,
}

#[derive(Debug, Deserialize)]
struct Round {
    selected: Vec<IpAddr>,
    completed: usize,
    rounds_finished: u64,
    last_round_size: usize,
}

/// Response from admin command.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    Clients { items: Vec<ClientEntry> },
    Requested {
        started: Vec<IpAddr>,
        skipped: Vec<(IpAddr, String)>,
    },
    Round { round: Round, clients: usize },
    Pong,
}

fn print_usage() {
    eprintln!("logpull-admin - Control a running Logpull hub");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  logpull-admin list                  List connected clients");
    eprintln!("  logpull-admin request-logs [ip...]  Pull logs (all clients when none given)");
    eprintln!("  logpull-admin check-status <ip>     Send a keepalive to one client");
    eprintln!("  logpull-admin status                Show the current request round");
    eprintln!("  logpull-admin restart               Reload config and rebind the listener");
    eprintln!("  logpull-admin ping                  Check if the hub is running");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  LOGPULL_SOCKET  Path to admin socket (default: ./logpull-data/admin.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("LOGPULL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./logpull-data/admin.sock"))
}

fn send_command(cmd: AdminCommand) -> Result<AdminResponse, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to logpull-hub at {:?}: {}\n\
             Is the hub running?",
            socket_path, e
        )
    })?;

    // Send command
    let cmd_json = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    // Read response
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn parse_ip(raw: &str) -> IpAddr {
    match raw.parse() {
        Ok(ip) => ip,
        Err(e) => {
            eprintln!("Error: {:?} is not an IP address: {}", raw, e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = match args[1].as_str() {
        "list" => AdminCommand::ListClients,
        "request-logs" => AdminCommand::RequestLogs {
            clients: args[2..].iter().map(|a| parse_ip(a)).collect(),
        },
        "check-status" => {
            if args.len() < 3 {
                eprintln!("Error: check-status requires an ip argument");
                std::process::exit(1);
            }
            AdminCommand::CheckStatus {
                client: parse_ip(&args[2]),
            }
        }
        "status" => AdminCommand::Status,
        "restart" => AdminCommand::RestartListener,
        "ping" => AdminCommand::Ping,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };

    match send_command(cmd) {
        Ok(response) => match response {
            AdminResponse::Ok { message } => {
                println!("{}", message);
            }
            AdminResponse::Error { error } => {
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }
            AdminResponse::Clients { items } => {
                if items.is_empty() {
                    println!("(none)");
                }
                for item in items {
                    println!(
                        "{:<40} {:<10} {:<10} {}{}",
                        item.identity,
                        item.host_name,
                        item.state,
                        item.connected_at,
                        if item.busy { " (busy)" } else { "" }
                    );
                }
            }
            AdminResponse::Requested { started, skipped } => {
                for ip in started {
                    println!("requested {}", ip);
                }
                for (ip, reason) in skipped {
                    println!("skipped   {} ({})", ip, reason);
                }
            }
            AdminResponse::Round { round, clients } => {
                println!("clients connected: {}", clients);
                println!(
                    "current round: {}/{} finished",
                    round.completed,
                    round.selected.len()
                );
                println!(
                    "rounds finished: {} (last had {} client(s))",
                    round.rounds_finished, round.last_round_size
                );
            }
            AdminResponse::Pong => {
                println!("pong - logpull-hub is running");
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
