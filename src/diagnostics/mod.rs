//! Remote diagnostics.
//!
//! The collector runs every probe concurrently against one endpoint, each
//! on its own connection, and returns a single report once all of them
//! have resolved. A probe that fails or times out degrades only its own
//! field.

pub mod probes;

pub use probes::{Probe, ProbeValue, default_probes};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::session::{SessionError, SessionId, SessionRegistry};
use crate::transport::{Endpoint, ExecOutput, Transport};

/// Default per-probe time limit, covering connect and execution.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeOutcome {
    Value(ProbeValue),
    Failed { error: String },
}

impl ProbeOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            error: message.into(),
        }
    }

    /// True for a failed probe.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(ProbeValue::Percent(p)) => write!(f, "{:.1}%", p),
            Self::Value(ProbeValue::Usage {
                used,
                total,
                percent,
            }) => write!(f, "{} / {} ({:.1}%)", used, total, percent),
            Self::Value(ProbeValue::Text(text)) => f.write_str(text),
            Self::Failed { error } => write!(f, "error: {}", error),
        }
    }
}

/// Aggregated result of one collection: one field per probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DiagnosticReport {
    fields: BTreeMap<String, ProbeOutcome>,
}

impl DiagnosticReport {
    /// Returns the outcome of the probe named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProbeOutcome> {
        self.fields.get(name)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the report has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of failed probes.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.fields.values().filter(|o| o.is_error()).count()
    }

    /// Fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProbeOutcome)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Runs probe fan-outs against sessions of a registry.
pub struct DiagnosticCollector {
    transport: Arc<dyn Transport>,
    registry: SessionRegistry,
    probes: Arc<[Probe]>,
    timeout: Duration,
}

impl DiagnosticCollector {
    /// Creates a collector with the default probe set and time limit.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, registry: SessionRegistry) -> Self {
        Self {
            transport,
            registry,
            probes: default_probes().into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Sets the per-probe time limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "probe timeout must be positive");
        self.timeout = timeout;
        self
    }

    /// Replaces the probe set. Names must be unique.
    #[must_use]
    pub fn with_probes(mut self, probes: Vec<Probe>) -> Self {
        assert!(!probes.is_empty(), "probe set must not be empty");
        let mut names: Vec<_> = probes.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), probes.len(), "probe names must be unique");
        self.probes = probes.into();
        self
    }

    /// Names of the configured probes, in run order.
    #[must_use]
    pub fn probe_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name).collect()
    }

    /// Collects a report for the endpoint of a live session.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is not live.
    pub async fn collect_diagnostics(&self, id: SessionId) -> Result<DiagnosticReport, SessionError> {
        let endpoint = self.registry.endpoint(id).await?;
        info!("Collecting diagnostics for session {}", id);
        Ok(self.collect_for_endpoint(&endpoint).await)
    }

    /// Runs every probe against `endpoint` and waits for all of them.
    pub async fn collect_for_endpoint(&self, endpoint: &Endpoint) -> DiagnosticReport {
        let mut report = DiagnosticReport::default();
        for probe in self.probes.iter() {
            report
                .fields
                .insert(probe.name.to_string(), ProbeOutcome::failed("Probe did not complete"));
        }

        let mut tasks = JoinSet::new();
        for probe in self.probes.iter().copied() {
            let transport = Arc::clone(&self.transport);
            let endpoint = endpoint.clone();
            let limit = self.timeout;
            tasks.spawn(async move {
                let outcome = run_probe(transport.as_ref(), &endpoint, &probe, limit).await;
                (probe.name, outcome)
            });
        }

        let mut pending = self.probes.len();
        while let Some(joined) = tasks.join_next().await {
            pending -= 1;
            match joined {
                Ok((name, outcome)) => {
                    if let ProbeOutcome::Failed { ref error } = outcome {
                        debug!("Probe {} failed: {}", name, error);
                    }
                    report.fields.insert(name.to_string(), outcome);
                }
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }
        debug_assert_eq!(pending, 0);

        info!(
            "Diagnostics for {} complete ({} of {} probes failed)",
            endpoint.display_string(),
            report.error_count(),
            report.len()
        );
        report
    }
}

/// Connects, runs one probe and always closes the connection. Returns by
/// the deadline even when the close is slow.
async fn run_probe(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    probe: &Probe,
    limit: Duration,
) -> ProbeOutcome {
    let deadline = Instant::now() + limit;

    let connection = match timeout_at(deadline, transport.connect(endpoint)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => return ProbeOutcome::failed(format!("Connection error: {}", e)),
        Err(_) => {
            return ProbeOutcome::failed(format!(
                "Timed out after {}s while connecting",
                limit.as_secs_f32()
            ));
        }
    };

    let result = timeout_at(deadline, connection.exec(probe.command)).await;

    // The close gets whatever is left of the deadline, then finishes detached.
    let closing = tokio::spawn(async move { connection.close().await });
    if timeout_at(deadline, closing).await.is_err() {
        debug!("Probe {} connection still closing at deadline", probe.name);
    }

    match result {
        Ok(Ok(output)) => interpret(probe, &output),
        Ok(Err(e)) => ProbeOutcome::failed(e.to_string()),
        Err(_) => ProbeOutcome::failed(format!("Timed out after {}s", limit.as_secs_f32())),
    }
}

/// Maps command output to a field value.
///
/// Stderr only fails the probe when the command also failed or printed
/// nothing on stdout.
fn interpret(probe: &Probe, output: &ExecOutput) -> ProbeOutcome {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() && (!output.success() || output.stdout.trim().is_empty()) {
        return ProbeOutcome::failed(stderr);
    }
    if !output.success() {
        return ProbeOutcome::failed(format!("Exit status {}", output.exit_status));
    }

    match (probe.parse)(&output.stdout) {
        Ok(value) => ProbeOutcome::Value(value),
        Err(e) => ProbeOutcome::failed(e),
    }
}
