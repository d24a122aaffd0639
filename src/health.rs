//! Aggregate health reporting.
//!
//! The fold over per-service states is the only view the outer platform ever
//! reads: `unhealthy` if any service is Failed, `healthy` iff every service is
//! Healthy, `degraded` otherwise. It is served two ways: an optional HTTP
//! endpoint inside the supervisor, and the `health` subcommand that queries it
//! and maps the answer to an exit code.
use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::state::{ServiceState, ServiceStatus, StateTable};

/// Folded status across every supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AggregateStatus {
    /// Every service is Healthy.
    Healthy,
    /// No service is Failed, but at least one is not Healthy.
    Degraded,
    /// At least one service is Failed.
    Unhealthy,
}

/// Payload served by the `/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Folded status.
    pub status: AggregateStatus,
    /// Per-service detail, ordered by id.
    pub services: Vec<ServiceState>,
}

impl HealthReport {
    /// Builds the report from a state snapshot.
    pub fn from_states(services: Vec<ServiceState>) -> Self {
        Self {
            status: aggregate(&services),
            services,
        }
    }
}

/// Stateless fold over current service states.
pub fn aggregate(states: &[ServiceState]) -> AggregateStatus {
    if states
        .iter()
        .any(|state| state.status == ServiceStatus::Failed)
    {
        return AggregateStatus::Unhealthy;
    }

    if states
        .iter()
        .all(|state| state.status == ServiceStatus::Healthy)
    {
        return AggregateStatus::Healthy;
    }

    AggregateStatus::Degraded
}

/// A running `/health` endpoint.
#[derive(Debug)]
pub struct HealthServer {
    addr: SocketAddr,
}

impl HealthServer {
    /// The bound address, useful when the config asked for port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Binds the aggregate health endpoint and serves it from a background thread.
///
/// Replies `200` with the JSON report while the fold is healthy or degraded,
/// `503` when unhealthy. Anything that is not a GET for `/health` gets a 404.
pub fn spawn_health_endpoint(
    bind: &str,
    states: Arc<StateTable>,
) -> Result<HealthServer, SupervisorError> {
    let listener = TcpListener::bind(bind).map_err(SupervisorError::HealthEndpoint)?;
    let addr = listener
        .local_addr()
        .map_err(SupervisorError::HealthEndpoint)?;

    info!("Aggregate health endpoint listening on {addr}");

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(err) = serve_request(stream, &states) {
                        debug!("Health endpoint request failed: {err}");
                    }
                }
                Err(err) => {
                    warn!("Health endpoint accept error: {err}");
                }
            }
        }
    });

    Ok(HealthServer { addr })
}

fn serve_request(
    stream: std::net::TcpStream,
    states: &StateTable,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Drain the remaining headers so the client sees a clean close.
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let mut stream = reader.into_inner();

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    if method != "GET" || !path.starts_with("/health") {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        stream.write_all(response.as_bytes())?;
        return Ok(());
    }

    let report = HealthReport::from_states(states.snapshot());
    let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
    let status_line = match report.status {
        AggregateStatus::Unhealthy => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 200 OK",
    };

    let response = format!(
        "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())
}

/// Queries a running supervisor's health endpoint.
///
/// An unreachable endpoint is reported as an error; the caller maps it to the
/// unhealthy exit code.
pub fn check_endpoint(url: &str, timeout: Duration) -> Result<HealthReport, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| err.to_string())?;

    let response = client.get(url).send().map_err(|err| err.to_string())?;
    let body = response.text().map_err(|err| err.to_string())?;

    serde_json::from_str(&body).map_err(|err| format!("invalid health payload: {err}"))
}
