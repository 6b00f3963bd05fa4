use std::collections::HashMap;
use std::io::Write;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use svc::error::StructuredError;
use svc::ids::CommandId;
use svc::pipeline::{Envelope, StageSpec, WorkItem, command, start_pipeline};
use svc::{Container, LogLevel, Service, ServiceHandle, ServiceInterface, ServiceState};

#[derive(Parser)]
#[command(author, version, about = "Service container and staged pipeline runtime demo")]
struct Cli {
    /// Identifies this process instance to anything watching its metrics or logs.
    #[arg(long)]
    app_id: u64,

    /// Initial global log level.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Formatter function to output in syslog format. Used when running under
/// systemd, where output typically goes to the journal rather than a tty.
#[allow(clippy::match_same_arms)]
fn syslog_format(
    buf: &mut pretty_env_logger::env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        buf,
        "<{}>{}: {}",
        match record.level() {
            log::Level::Error => 3,
            log::Level::Warn => 4,
            log::Level::Info => 6,
            log::Level::Debug => 7,
            log::Level::Trace => 7,
        },
        record.target(),
        record.args()
    )
}

fn init_logging(level: LogLevel) {
    let running_under_systemd =
        std::env::var("SYSTEMD_EXEC_PID").is_ok_and(|pid| pid == std::process::id().to_string());

    let result = if running_under_systemd {
        pretty_env_logger::env_logger::builder()
            .format(syslog_format)
            .filter_level(level.to_level_filter())
            .parse_env("RUST_LOG")
            .try_init()
    } else {
        pretty_env_logger::formatted_timed_builder()
            .filter_level(level.to_level_filter())
            .parse_env("RUST_LOG")
            .try_init()
    };

    if let Err(err) = result {
        eprintln!("failed to install logger: {err}");
    }
}

/// A service with no pipeline of its own: just ticks on an interval until
/// asked to stop. Stands in for the kind of small housekeeping service a
/// real deployment registers alongside its heavier ones.
struct Heartbeat {
    app_id: u64,
}

impl ServiceInterface for Heartbeat {
    const NAME: &'static str = "harbor::Heartbeat";
}

#[async_trait::async_trait]
impl Service for Heartbeat {
    async fn run(self: Arc<Self>, handle: ServiceHandle) -> Result<(), StructuredError> {
        let mut ticks = tokio::time::interval(Duration::from_secs(10));
        let dying = handle.dying_signal();
        loop {
            tokio::select! {
                _ = dying.cancelled() => return Ok(()),
                _ = ticks.tick() => {
                    log::debug!("heartbeat app_id={}", self.app_id);
                }
            }
        }
    }
}

/// Owns a two-stage text pipeline and feeds it a payload on an interval,
/// logging whatever comes out the other end. Demonstrates wiring a staged
/// pipeline on top of a registered service, per the metrics registry the
/// container hands it at construction time.
struct Ingest {
    metrics: svc::metrics::MetricsRegistry,
}

impl ServiceInterface for Ingest {
    const NAME: &'static str = "harbor::Ingest";
}

#[async_trait::async_trait]
impl Service for Ingest {
    async fn run(self: Arc<Self>, handle: ServiceHandle) -> Result<(), StructuredError> {
        let stages = vec![
            StageSpec::new(
                command(CommandId::new(1), "normalize", |s: String| Ok(s.trim().to_lowercase())),
                2,
            ),
            StageSpec::new(
                command(CommandId::new(2), "exclaim", |s: String| Ok(format!("{s}!"))),
                2,
            ),
        ];
        let pipeline = start_pipeline(&handle, stages, self.metrics.clone());
        let input = pipeline.input();
        let output = pipeline.output();

        let mut ticks = tokio::time::interval(Duration::from_secs(5));
        let dying = handle.dying_signal();
        loop {
            tokio::select! {
                _ = dying.cancelled() => break,
                _ = ticks.tick() => {
                    let _ = input.send(WorkItem::Work(Envelope::new("  Hello Harbor  ".to_string()))).await;
                }
                Ok(item) = output.recv() => {
                    if let WorkItem::Work(envelope) = item {
                        match &envelope.error {
                            None => log::info!("ingest produced: {}", envelope.payload),
                            Some(err) => log::warn!("ingest item failed: {err}"),
                        }
                    }
                }
            }
        }
        pipeline.shutdown().await;
        Ok(())
    }
}

async fn run(cli: &Cli) -> Result<ExitCode, svc::Error> {
    let container = Container::new()?;

    let app_id = cli.app_id;
    container.register::<_, Heartbeat>(
        Arc::new(move |_container: &Container| Ok(Some(Arc::new(Heartbeat { app_id })))),
        semver::Version::new(1, 0, 0),
        HashMap::new(),
    )?;

    container.register::<_, Ingest>(
        Arc::new(|container: &Container| Ok(Some(Arc::new(Ingest { metrics: container.metrics().clone() })))),
        semver::Version::new(1, 0, 0),
        HashMap::new(),
    )?;

    log::info!("harbor running, app_id={}", cli.app_id);
    container.run().await?;

    let any_failed = container.entries().iter().any(|entry| entry.state() == ServiceState::Failed);
    Ok(if any_failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match LogLevel::from_str(&cli.log_level) {
        Ok(level) => level,
        Err(err) => {
            eprintln!("invalid --log-level: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(log_level);

    match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("harbor error: {err}");
            ExitCode::FAILURE
        }
    }
}
