//! Line-oriented operator console on stdin.

use bitnode_network::{NetworkHandle, PeerId};
use std::fmt::Write as _;
use std::net::IpAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// What the console should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Print and keep reading.
    Print(String),
    /// Stop the node.
    Quit,
}

const HELP: &str = "\
Commands:
  net          list connections and counters
  node <id>    show one connection (hex id from 'net')
  drop <ip>    disconnect every connection to an IP
  help         this text
  quit         shut down";

/// Read commands until `quit` or end of input.
pub async fn run(network: NetworkHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Console read failed");
                return;
            }
        };
        match execute(&network, &line) {
            Outcome::Print(text) if text.is_empty() => {}
            Outcome::Print(text) => println!("{}", text),
            Outcome::Quit => {
                info!("Quit requested from console");
                network.shutdown();
                return;
            }
        }
    }
}

/// Run one console command.
pub fn execute(network: &NetworkHandle, line: &str) -> Outcome {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Outcome::Print(String::new());
    };
    let arg = words.next();

    match (command, arg) {
        ("net", _) => Outcome::Print(net_stats(network)),
        ("node", Some(id)) => Outcome::Print(node_info(network, id)),
        ("drop", Some(ip)) => Outcome::Print(drop_ip(network, ip)),
        ("help", _) | ("?", _) => Outcome::Print(HELP.to_string()),
        ("quit", _) | ("q", _) => Outcome::Quit,
        ("node", None) | ("drop", None) => Outcome::Print(format!("'{}' needs an argument", command)),
        _ => Outcome::Print(format!("Unknown command '{}'. Try 'help'.", command)),
    }
}

fn net_stats(network: &NetworkHandle) -> String {
    let mut out = String::new();
    let rows = network.connections();
    for row in &rows {
        let _ = writeln!(
            out,
            "{:>12} {:>3} {:<22} {:<10} {:>10} {:>10} {:>7} {:>4}",
            row.id.to_string(),
            row.direction.to_string(),
            row.addr.to_string(),
            row.last_command,
            bytes(row.bytes_sent),
            bytes(row.bytes_received),
            row.send_pending,
            row.inventory_pending,
        );
    }

    let stats = network.stats();
    let _ = write!(
        out,
        "{} connections ({} in / {} out), invs sent {}, blocks sent {}, timeouts {}",
        rows.len(),
        stats.inbound,
        stats.outbound,
        stats.invs_sent,
        stats.blocks_sent,
        stats.timeouts,
    );
    if network.is_server() {
        match network.external_address() {
            Some(addr) => {
                let _ = write!(out, "\nListening at external address {}", addr);
            }
            None => out.push_str("\nExternal address not known yet"),
        }
    }
    out
}

fn node_info(network: &NetworkHandle, id: &str) -> String {
    let Ok(id) = id.parse::<PeerId>() else {
        return format!("Bad connection id '{}'", id);
    };
    let Some(detail) = network.connection(&id) else {
        return format!("No connection {}", id);
    };

    let s = &detail.summary;
    let mut out = String::new();
    let _ = writeln!(out, "Connection {} ({}) to {}", s.id, s.direction, s.addr);
    let _ = writeln!(out, " State: {}", s.state);
    let _ = writeln!(out, " Connected for {}s", detail.connected_for.as_secs());
    if let Some(version) = &detail.version {
        let _ = writeln!(out, " Node Version: {}", version.version);
        let _ = writeln!(out, " User Agent: {}", version.user_agent.as_deref().unwrap_or("-"));
        let _ = writeln!(out, " Chain Height: {}", version.start_height.unwrap_or_default());
    }
    let _ = writeln!(out, " Last command: {}", s.last_command);
    let _ = writeln!(out, " Bytes sent: {}, received: {}", bytes(s.bytes_sent), bytes(s.bytes_received));
    let _ = writeln!(out, " Pending send: {}, pending inv: {}", s.send_pending, s.inventory_pending);
    let _ = write!(out, " Ticks: {}, loops: {}", detail.ticks, detail.loops);
    if let Some(next) = detail.next_announce_in {
        let _ = write!(out, "\n Next address announcement in {}s", next.as_secs());
    }
    out
}

fn drop_ip(network: &NetworkHandle, ip: &str) -> String {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return format!("Bad IP '{}'", ip);
    };
    if network.drop_ip(ip) {
        format!("Dropping {}", ip)
    } else {
        format!("Not connected to {}", ip)
    }
}

/// Human-readable byte count.
fn bytes(val: u64) -> String {
    match val {
        v if v < 1_000_000 => format!("{:.1}k", v as f64 / 1_000.0),
        v if v < 1_000_000_000 => format!("{:.2}M", v as f64 / 1_000_000.0),
        v => format!("{:.2}G", v as f64 / 1_000_000_000.0),
    }
}
