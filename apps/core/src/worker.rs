use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::discovery::{ScanContext, SourceRegistry, WindowSource};
use crate::logging::Logger;
use crate::model::ExecutionMode;
use crate::protocol::{decode_request, encode_line, WorkerRequest, WorkerResultMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub reported: usize,
    pub unknown: Vec<String>,
}

/// Serializes whole lines onto the transport. Sources finishing at the same
/// moment never interleave partial lines.
struct LineWriter<W> {
    out: Mutex<W>,
}

impl<W: Write> LineWriter<W> {
    fn emit(&self, message: &WorkerResultMessage) -> Result<(), std::io::Error> {
        let line = encode_line(message).map_err(std::io::Error::other)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.flush()
    }
}

/// Runs every requested isolated source concurrently and streams one result
/// line per source as it finishes, followed by the sentinel.
pub fn run_worker<W>(
    request: &WorkerRequest,
    registry: &SourceRegistry,
    out: W,
    logger: &Logger,
) -> Result<WorkerSummary, std::io::Error>
where
    W: Write + Send,
{
    let (selected, unknown) = select_sources(request, registry);
    let ctx = ScanContext::new(&request.excluded_processes);
    let writer = LineWriter {
        out: Mutex::new(out),
    };

    for name in &unknown {
        logger.warn(format!("requested source '{name}' is not an isolated source"));
        writer.emit(&WorkerResultMessage::failed(name, "unknown isolated source"))?;
    }

    let reported = thread::scope(|scope| {
        let handles: Vec<_> = selected
            .iter()
            .map(|source| {
                let writer = &writer;
                let ctx = &ctx;
                scope.spawn(move || {
                    let message = scan_one(source.as_ref(), ctx);
                    if let Some(error) = &message.error {
                        logger.warn(format!("{}: {error}", message.plugin_name));
                    }
                    writer.emit(&message)
                })
            })
            .collect();

        let mut reported = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => reported += 1,
                Ok(Err(error)) => logger.error(format!("failed to write result line: {error}")),
                Err(_) => logger.error("source thread panicked while writing"),
            }
        }
        reported
    });

    writer.emit(&WorkerResultMessage::sentinel())?;
    Ok(WorkerSummary { reported, unknown })
}

/// Worker process entry: one request line on stdin, results on stdout.
pub fn serve_stdio(registry: &SourceRegistry, logger: &Logger) -> Result<WorkerSummary, std::io::Error> {
    let mut raw = String::new();
    std::io::stdin().lock().read_line(&mut raw)?;

    let request = match decode_request(&raw) {
        Ok(request) => request,
        Err(error) => {
            logger.error(format!("invalid worker request: {error}"));
            // Sentinel anyway; the host must not sit out its timeout.
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            out.write_all(
                encode_line(&WorkerResultMessage::sentinel())
                    .map_err(std::io::Error::other)?
                    .as_bytes(),
            )?;
            out.flush()?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                error.to_string(),
            ));
        }
    };

    run_worker(&request, registry, std::io::stdout(), logger)
}

fn select_sources(
    request: &WorkerRequest,
    registry: &SourceRegistry,
) -> (Vec<Arc<dyn WindowSource>>, Vec<String>) {
    let disabled: HashSet<&str> = request.disabled_plugins.iter().map(String::as_str).collect();

    if request.plugins.is_empty() {
        let selected = registry
            .isolated()
            .filter(|s| !disabled.contains(s.name()))
            .cloned()
            .collect();
        return (selected, Vec::new());
    }

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    let mut unknown = Vec::new();
    for name in &request.plugins {
        if !seen.insert(name.as_str()) || disabled.contains(name.as_str()) {
            continue;
        }
        match registry.get(name) {
            Some(source) if source.descriptor().mode == ExecutionMode::Isolated => {
                selected.push(Arc::clone(source));
            }
            _ => unknown.push(name.clone()),
        }
    }
    (selected, unknown)
}

fn scan_one(source: &dyn WindowSource, ctx: &ScanContext) -> WorkerResultMessage {
    let name = source.name();
    match catch_unwind(AssertUnwindSafe(|| source.scan(ctx))) {
        Ok(Ok(mut windows)) => {
            ctx.retain_allowed(&mut windows);
            WorkerResultMessage::windows(name, windows)
        }
        Ok(Err(error)) => WorkerResultMessage::failed(name, error.to_string()),
        Err(_) => WorkerResultMessage::failed(name, "scan panicked"),
    }
}
