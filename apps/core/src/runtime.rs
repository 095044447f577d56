use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::{self, Config, ConfigError};
use crate::discovery::{platform_registry, SourceRegistry};
use crate::logging::{self, FileSink, LogSink, Logger, TeeSink, TracingSink};
use crate::model::WindowRecord;
use crate::orchestrator::{CycleSummary, Orchestrator, ScanSettings, SourceReport};
use crate::reconciler::{ListOp, Reconciler};
use crate::worker;
use crate::worker_session::WorkerCommand;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Parser)]
#[command(name = "switchscan-core", version, about = "Discovers activatable windows and tabs")]
pub struct Cli {
    /// Config file (.toml, .json or .json5).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run one scan cycle and print the reconciled list.
    Scan {
        #[arg(long)]
        json: bool,
    },
    /// Run scan cycles repeatedly and print list operations as they apply.
    Watch {
        #[arg(long)]
        cycles: Option<u32>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// List the registered discovery sources.
    Sources,
    /// Child mode: read one request on stdin, stream results on stdout.
    #[command(hide = true)]
    Worker,
}

pub fn run(cli: Cli) -> Result<(), RuntimeError> {
    match cli.command.unwrap_or(CliCommand::Scan { json: false }) {
        // Stdout is the transport in worker mode; nothing else may write to it.
        CliCommand::Worker => {
            init_tracing("warn");
            let logger = Logger::tracing().scoped("worker");
            worker::serve_stdio(&platform_registry(), &logger)?;
            Ok(())
        }
        CliCommand::Sources => {
            print_sources(&platform_registry());
            Ok(())
        }
        CliCommand::Scan { json } => {
            let cfg = load_config(cli.config)?;
            let logger = build_logger(&cfg);
            let orchestrator = build_orchestrator(&cfg, &logger);
            let mut reconciler = Reconciler::new();
            let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});
            log_summary(&logger, &summary);
            print_records(reconciler.items(), json)?;
            Ok(())
        }
        CliCommand::Watch {
            cycles,
            interval_ms,
        } => {
            let cfg = load_config(cli.config)?;
            let logger = build_logger(&cfg);
            let orchestrator = build_orchestrator(&cfg, &logger);
            let interval = interval_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| cfg.watch_interval());
            let mut reconciler = Reconciler::new();
            let mut cycle = 0_u32;
            loop {
                cycle += 1;
                let summary = orchestrator.run_cycle(&mut reconciler, print_ops);
                log_summary(&logger, &summary);
                if cycles.is_some_and(|limit| cycle >= limit) {
                    return Ok(());
                }
                std::thread::sleep(interval);
            }
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config, RuntimeError> {
    let cfg = config::load(path.as_deref())?;
    if !cfg.config_path.exists() {
        config::save(&cfg)?;
        eprintln!(
            "[switchscan-core] wrote default config to {}",
            cfg.config_path.display()
        );
    }
    init_tracing(&cfg.log_level);
    Ok(cfg)
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn build_logger(cfg: &Config) -> Logger {
    if !cfg.log_to_file {
        return Logger::tracing();
    }
    let level = logging::parse_level(&cfg.log_level).unwrap_or(logging::Level::INFO);
    match FileSink::open(&logging::logs_dir(), level) {
        Ok(file) => {
            let sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(TracingSink), Arc::new(file)];
            Logger::new(Arc::new(TeeSink::new(sinks)))
        }
        Err(error) => {
            let logger = Logger::tracing();
            logger.warn(format!("file logging unavailable: {error}"));
            logger
        }
    }
}

pub fn build_orchestrator(cfg: &Config, logger: &Logger) -> Orchestrator {
    let settings = ScanSettings::from_config(cfg);
    let registry = platform_registry();
    match WorkerCommand::from_config(cfg) {
        Ok(command) => Orchestrator::with_worker(registry, settings, command, logger.clone()),
        Err(error) => {
            logger.warn(format!(
                "cannot resolve worker executable, isolated sources disabled: {error}"
            ));
            Orchestrator::new(registry, settings, logger.clone())
        }
    }
}

fn log_summary(logger: &Logger, summary: &CycleSummary) {
    logger.info(format!(
        "cycle done: reported={} failed={} pending={} operations={}",
        summary.reported.len(),
        summary.failed.len(),
        summary.pending.len(),
        summary.operations
    ));
}

fn print_sources(registry: &SourceRegistry) {
    for source in registry.all() {
        let descriptor = source.descriptor();
        println!("{}\t{:?}", descriptor.name, descriptor.mode);
    }
}

fn print_records(records: &[Arc<WindowRecord>], json: bool) -> Result<(), RuntimeError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for record in records {
        if json {
            writeln!(out, "{}", serde_json::to_string(record.as_ref())?)?;
        } else {
            writeln!(
                out,
                "{}\t{}\t{}\t{}",
                record.source_id, record.handle, record.process_name, record.title
            )?;
        }
    }
    Ok(())
}

fn print_ops(report: &SourceReport, ops: &[ListOp]) {
    for op in ops {
        match op {
            ListOp::Remove { index } => println!("{} - [{index}]", report.source),
            ListOp::Insert { index, record } => {
                println!("{} + [{index}] {}", report.source, record.title)
            }
            ListOp::Move { from, to } => println!("{} ~ [{from}] -> [{to}]", report.source),
        }
    }
}
