//! Gateway service: host-side companion to the master node.
//!
//! This service:
//! - Opens the master node's serial link
//! - Reads `###`-prefixed event lines and parses them with `meshcore::host_protocol`
//! - Forwards parsed events over a channel to a processing task
//!
//! Architecture: serial port -> line reader -> parser -> channel -> processor

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meshcore::host_protocol::Event;
use meshcore::NodeId;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum GatewayError {
    #[error("failed to open serial port {path}")]
    SerialOpen {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },
}

/// CLI arguments for the gateway service.
#[derive(Debug, Parser)]
#[command(about = "Relays ###-prefixed master node events off a serial link")]
struct Args {
    /// Serial device the master node is attached to.
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Baud rate of the master's host UART.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Optional `node_id=name` pairs for friendlier logging, e.g. `5=porch-light`.
    #[arg(long = "name", value_parser = parse_name_mapping)]
    names: Vec<(u8, String)>,
}

fn parse_name_mapping(s: &str) -> Result<(u8, String), String> {
    let (id, name) = s.split_once('=').ok_or_else(|| format!("expected NODE=NAME, got {s}"))?;
    let id: u8 = id.parse().map_err(|_| format!("invalid node id: {id}"))?;
    Ok((id, name.to_string()))
}

fn node_name(names: &[(u8, String)], node: NodeId) -> String {
    names
        .iter()
        .find(|(id, _)| *id == node.as_u8())
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| node.as_u8().to_string())
}

/// Parses one line of serial output. Non-`###` lines (debug logs from the
/// master's own `defmt` channel, if it shares the link) are passed through
/// for visibility rather than discarded.
fn parse_event_line(line: &str) -> Option<Event> {
    if !line.starts_with("###") {
        return None;
    }
    match Event::parse(line.trim_end()) {
        Ok(event) => Some(event),
        Err(_) => {
            warn!(line = %line.trim_end(), "unparseable event line");
            None
        }
    }
}

/// Reads lines off the serial port and sends parsed events to `tx`.
async fn read_events(
    mut reader: BufReader<tokio_serial::SerialStream>,
    tx: mpsc::Sender<Event>,
) -> Result<()> {
    let mut line_buf = String::new();
    info!("starting serial event reader");

    loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => {
                warn!("serial port closed (EOF)");
                break;
            }
            Ok(_) => {
                if let Some(event) = parse_event_line(&line_buf) {
                    if tx.send(event).await.is_err() {
                        error!("event channel closed, stopping reader");
                        break;
                    }
                } else if !line_buf.starts_with("###") {
                    print!("{line_buf}");
                }
            }
            Err(e) => {
                error!(error = %e, "error reading from serial port");
                break;
            }
        }
    }

    Ok(())
}

/// Processes mesh events (placeholder for a downstream sink).
async fn process_events(mut rx: mpsc::Receiver<Event>, names: Vec<(u8, String)>) {
    info!("starting event processor");

    while let Some(event) = rx.recv().await {
        match event {
            Event::Ack { node, code } => {
                info!(node = %node_name(&names, node), code, "ack received");
            }
            Event::Status { node, status } => {
                info!(node = %node_name(&names, node), status, "status update");
            }
            Event::Raw { node, count } => {
                info!(node = %node_name(&names, node), count, "raw frame block starting");
            }
            Event::Timeout { node } => {
                warn!(node = %node_name(&names, node), "retransmission limit reached");
            }
            Event::Err => {
                warn!("master reported a command error");
            }
        }

        // TODO: publish to a downstream sink once one exists.
    }

    info!("event processor stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!(port = %args.port, baud = args.baud, "gateway service starting");

    let port = tokio_serial::new(&args.port, args.baud)
        .timeout(Duration::from_secs(1))
        .open_native_async()
        .map_err(|source| GatewayError::SerialOpen {
            path: args.port.clone(),
            source,
        })
        .context("opening master node serial link")?;

    let (tx, rx) = mpsc::channel::<Event>(100);

    let reader_handle = tokio::spawn(async move {
        let reader = BufReader::new(port);
        if let Err(e) = read_events(reader, tx).await {
            error!(error = %e, "reader task failed");
        }
    });

    let processor_handle = tokio::spawn(process_events(rx, args.names));

    info!("gateway running, press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = reader_handle => {
            warn!("reader task ended unexpectedly");
        }
    }

    processor_handle.abort();
    info!("gateway service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_event_line() {
        let event = parse_event_line("###STATUS5-3\n").unwrap();
        assert_eq!(event, Event::Status { node: NodeId::new(5), status: 3 });
    }

    #[test]
    fn ignores_plain_log_lines() {
        assert_eq!(parse_event_line("[INFO] booting\n"), None);
    }

    #[test]
    fn parses_node_name_mapping() {
        let (id, name) = parse_name_mapping("7=porch-light").unwrap();
        assert_eq!(id, 7);
        assert_eq!(name, "porch-light");
    }

    #[test]
    fn node_name_falls_back_to_numeric_id() {
        let names = vec![(7u8, "porch-light".to_string())];
        assert_eq!(node_name(&names, NodeId::new(7)), "porch-light");
        assert_eq!(node_name(&names, NodeId::new(9)), "9");
    }
}
