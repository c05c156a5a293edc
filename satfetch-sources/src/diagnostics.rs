//! Network diagnostics collected when failures pile up.
//!
//! Resolves each configured host and tries a TCP connect to it, then logs one
//! report. Nothing here is returned to callers. At most one collection runs at
//! a time; triggers arriving meanwhile are dropped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use satfetch_common::stats::{DiagnosticsHook, DiagnosticsTrigger};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_PORT: u16 = 443;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HostCheck {
    pub host: String,
    pub resolved: Result<Vec<SocketAddr>, String>,
    /// Connect time to the first resolved address, when resolution worked.
    pub connect: Option<Result<Duration, String>>,
}

impl HostCheck {
    pub fn is_healthy(&self) -> bool {
        matches!(self.connect, Some(Ok(_)))
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub local_hostname: String,
    pub checks: Vec<HostCheck>,
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local host {}", self.local_hostname)?;
        for check in &self.checks {
            write!(f, "; {}: ", check.host)?;
            match &check.resolved {
                Ok(addrs) => write!(f, "resolved {} address(es)", addrs.len())?,
                Err(e) => write!(f, "DNS failed ({})", e)?,
            }
            match &check.connect {
                Some(Ok(elapsed)) => write!(f, ", connect ok in {}ms", elapsed.as_millis())?,
                Some(Err(e)) => write!(f, ", connect failed ({})", e)?,
                None => {}
            }
        }
        Ok(())
    }
}

pub struct NetworkDiagnostics {
    hosts: Vec<String>,
    probe_timeout: Duration,
    running: AtomicBool,
    completed: AtomicU64,
}

impl NetworkDiagnostics {
    /// `hosts` are `host` or `host:port` strings; port 443 is assumed when absent.
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            running: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        }
    }

    /// Collections that ran to completion.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub async fn run(&self) -> DiagnosticsReport {
        let mut checks = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            checks.push(self.check(host).await);
        }
        DiagnosticsReport {
            local_hostname: local_hostname(),
            checks,
        }
    }

    async fn check(&self, host: &str) -> HostCheck {
        let (name, port) = split_host_port(host);
        let resolved = match timeout(self.probe_timeout, tokio::net::lookup_host((name, port))).await
        {
            Ok(Ok(addrs)) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    Err("no addresses".to_string())
                } else {
                    Ok(addrs)
                }
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out".to_string()),
        };

        let connect = match &resolved {
            Ok(addrs) => {
                let started = Instant::now();
                Some(match timeout(self.probe_timeout, TcpStream::connect(addrs[0])).await {
                    Ok(Ok(_)) => Ok(started.elapsed()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timed out".to_string()),
                })
            }
            Err(_) => None,
        };

        HostCheck {
            host: host.to_string(),
            resolved,
            connect,
        }
    }
}

#[async_trait]
impl DiagnosticsHook for NetworkDiagnostics {
    async fn collect(&self, trigger: DiagnosticsTrigger) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!(source = %trigger.source, "Diagnostics already running, skipping");
            return;
        }
        let _running = RunningGuard(&self.running);
        let report = self.run().await;
        self.completed.fetch_add(1, Ordering::Relaxed);
        let last_error = trigger
            .recent_errors
            .last()
            .and_then(|r| r.message.clone())
            .unwrap_or_default();
        warn!(
            source = %trigger.source,
            total_failures = trigger.total_failures,
            last_error = %last_error,
            report = %report,
            "Network diagnostics"
        );
    }
}

/// Clears the in-flight flag even if the collection is dropped midway.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn split_host_port(host: &str) -> (&str, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, port),
            Err(_) => (host, DEFAULT_PORT),
        },
        None => (host, DEFAULT_PORT),
    }
}
