use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use mimic_gateway::config::{BypassRule, Conf, RunMode};
use mimic_gateway::log::EngineLog;
use mimic_gateway::mock::{CaptureSink, MockStore};
use mimic_gateway::{ModeContext, SessionController};
use mock_sink::{sink_channel, CapturedMock, MockSink};

/// Placeholder collaborator for the outbound mock stream (§6): the
/// on-disk mock format is explicitly out of scope for this core, so the
/// default binary just logs what it would have persisted. A real
/// deployment supplies its own `MockSink` impl.
struct LoggingSink;

#[async_trait::async_trait]
impl MockSink for LoggingSink {
    async fn store(&self, mock: CapturedMock) -> anyhow::Result<()> {
        tracing::info!(
            method = %mock.request.status_or_method,
            url = %mock.request.url_or_empty,
            status = %mock.response.status_or_method,
            "captured mock"
        );
        Ok(())
    }
}

/// Builds `Conf` from environment variables. The CLI/config-file layer
/// proper is out of scope for this core (§1); this is the minimal glue
/// a real deployment's launcher would replace.
fn conf_from_env() -> anyhow::Result<Conf> {
    let run_mode = match std::env::var("MIMIC_MODE").unwrap_or_else(|_| "record".to_owned()).as_str() {
        "record" => RunMode::Record,
        "test" => RunMode::Test,
        other => anyhow::bail!("unknown MIMIC_MODE {other:?}, expected \"record\" or \"test\""),
    };

    let listen_addr: SocketAddr = std::env::var("MIMIC_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9000".to_owned())
        .parse()
        .context("invalid MIMIC_LISTEN_ADDR")?;

    let log_file = Utf8PathBuf::from(std::env::var("MIMIC_LOG_FILE").unwrap_or_else(|_| "/tmp/mimic-gateway".to_owned()));
    let log_filter = std::env::var("MIMIC_LOG_FILTER").unwrap_or_else(|_| "info".to_owned());

    let bypass_rules: Vec<BypassRule> = Vec::new();

    Conf::from_parts(run_mode, listen_addr, &bypass_rules, log_file, log_filter)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let conf = conf_from_env()?;

    let _logger_guard = mimic_log::init::<EngineLog>(&conf.log_file, &conf.log_filter, None).context("failed to initialize logging")?;

    let run_mode = conf.run_mode;
    let controller = SessionController::new(conf);

    let mode = match run_mode {
        RunMode::Record => {
            let (sender, receiver) = sink_channel();
            let capture = Arc::new(CaptureSink::new(sender, Vec::new()));
            tokio::spawn(mock_sink::forward_to_sink(receiver, Arc::new(LoggingSink)));
            ModeContext::Record { capture }
        }
        RunMode::Test => {
            let (store_task, store_handle) = MockStore::new();
            let (shutdown_handle, shutdown_signal) = mimic_task::ShutdownHandle::new();
            // This handle has nothing else to coordinate with: the mock
            // store lives and dies with the process, same as the
            // connection tasks the runtime drops on exit.
            std::mem::forget(shutdown_handle);
            tokio::spawn(async move {
                use mimic_task::Task as _;
                store_task.run(shutdown_signal).await;
            });
            ModeContext::Mock { store: store_handle }
        }
    };

    // The kernel hook that would write real Open/Data/Close streams is out
    // of scope for this core; a deployment with one wires it up by passing
    // `Some(KernelEventStreams { .. })` built from its Unix sockets or
    // named pipes here instead.
    controller.run(mode, None).await
}
