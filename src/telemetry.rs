//! Logging setup and the best-effort observability sink.
//!
//! The library only emits `tracing` events. Hosts that want them on stdout or
//! on disk call [`init_logging`] once at startup.
//!
//! [`RunObserver`] is the seam for external cost/trace collectors. Observers
//! are called after state is persisted, and their failures are logged and
//! dropped.

use anyhow::{Context, Result};
use ideaforge_common::{AgentStatus, PhaseStatus};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.level`. When `config.directory` is set, a
/// daily-rolling `ideaforge.log` is written there too; keep the returned
/// guard alive for as long as logs should be flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ideaforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    match config.log_format() {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Something worth reporting to an external collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RunStarted {
        run_id: Uuid,
        workflow_type: String,
        trigger_type: String,
    },
    RunCompleted {
        run_id: Uuid,
        workflow_type: String,
        duration_seconds: Option<f64>,
    },
    RunFailed {
        run_id: Uuid,
        workflow_type: String,
        error: String,
    },
    WorkflowLocked {
        workflow_type: String,
    },
    CheckpointSaved {
        project_id: String,
        session_id: String,
        phase: u8,
        status: PhaseStatus,
        duration_seconds: Option<f64>,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Option<f64>,
    },
    AgentOutputSaved {
        project_id: String,
        session_id: String,
        phase: u8,
        agent_name: String,
        status: AgentStatus,
        input_tokens: u64,
        output_tokens: u64,
    },
    SessionCompleted {
        project_id: String,
        session_id: String,
        version: u32,
    },
}

/// Passive sink for [`TelemetryEvent`]s.
pub trait RunObserver: Send + Sync {
    fn record(&self, event: &TelemetryEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn record(&self, _event: &TelemetryEvent) -> Result<()> {
        Ok(())
    }
}

/// Re-emits events as `tracing` events on the `ideaforge::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn record(&self, event: &TelemetryEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("Failed to encode telemetry event")?;
        tracing::info!(target: "ideaforge::telemetry", event = %payload, "telemetry");
        Ok(())
    }
}

/// Deliver `event`, logging and discarding any observer failure.
pub(crate) fn notify(observer: &dyn RunObserver, event: TelemetryEvent) {
    if let Err(e) = observer.record(&event) {
        tracing::warn!(error = %e, "observer rejected telemetry event");
    }
}
