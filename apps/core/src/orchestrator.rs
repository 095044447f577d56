use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::{ScanCoalescingCache, ScanStatus};
use crate::config::Config;
use crate::discovery::{
    attribute, handled_processes, suppress_handled, ScanContext, SourceError, SourceRegistry,
    WindowSource,
};
use crate::logging::Logger;
use crate::model::{ExecutionMode, SourceDescriptor, WindowRecord};
use crate::protocol::{WorkerRequest, WorkerResultMessage};
use crate::reconciler::{ListOp, Reconciler};
use crate::worker_session::{SessionReport, SessionState, WorkerCommand, WorkerSession};

/// Extra time `run_cycle` waits past the worker timeout for in-process
/// sources before giving up on them for this cycle.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Inputs owned by the settings collaborator; replaceable between cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub worker_timeout: Duration,
    pub disabled_sources: HashSet<String>,
    pub excluded_processes: Vec<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ScanSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_timeout: cfg.worker_timeout(),
            disabled_sources: cfg.disabled_sources.iter().cloned().collect(),
            excluded_processes: cfg.excluded_processes.clone(),
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled_sources.contains(name)
    }
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source: String,
    pub mode: ExecutionMode,
    pub records: Vec<WindowRecord>,
    pub status: ScanStatus,
}

#[derive(Debug, Clone)]
pub enum CycleEvent {
    Source(SourceReport),
    Worker(SessionReport),
}

/// Receiving end of one cycle. Events arrive in completion order; the
/// channel closes once every source thread and the worker session are done.
pub struct CycleHandle {
    rx: Receiver<CycleEvent>,
    expected: Vec<String>,
}

impl CycleHandle {
    pub fn expected_sources(&self) -> &[String] {
        &self.expected
    }

    pub fn events(&self) -> mpsc::Iter<'_, CycleEvent> {
        self.rx.iter()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<CycleEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub reported: Vec<String>,
    pub failed: Vec<String>,
    /// Sources that had not reported when draining stopped.
    pub pending: Vec<String>,
    /// Sources whose rows were dropped because they are disabled or no
    /// longer registered.
    pub retired: Vec<String>,
    pub operations: usize,
    pub worker: Option<SessionReport>,
}

type IsolatedSnapshot = HashMap<String, Vec<WindowRecord>>;

struct Inner {
    registry: SourceRegistry,
    caches: HashMap<String, Arc<ScanCoalescingCache<Vec<WindowRecord>>>>,
    worker_command: Option<WorkerCommand>,
    worker_gate: ScanCoalescingCache<IsolatedSnapshot>,
    settings: RwLock<ScanSettings>,
    logger: Logger,
}

/// Fans a scan cycle out to every enabled source. Cloning shares state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(registry: SourceRegistry, settings: ScanSettings, logger: Logger) -> Self {
        Self::build(registry, settings, None, logger)
    }

    pub fn with_worker(
        registry: SourceRegistry,
        settings: ScanSettings,
        worker_command: WorkerCommand,
        logger: Logger,
    ) -> Self {
        Self::build(registry, settings, Some(worker_command), logger)
    }

    fn build(
        registry: SourceRegistry,
        settings: ScanSettings,
        worker_command: Option<WorkerCommand>,
        logger: Logger,
    ) -> Self {
        let cache_logger = logger.scoped("cache");
        let caches = registry
            .in_process()
            .map(|source| {
                let name = source.name().to_string();
                let cache = Arc::new(ScanCoalescingCache::new(&name, cache_logger.clone()));
                (name, cache)
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry,
                caches,
                worker_command,
                worker_gate: ScanCoalescingCache::new("isolated", cache_logger),
                settings: RwLock::new(settings),
                logger: logger.scoped("orchestrator"),
            }),
        }
    }

    pub fn settings(&self) -> ScanSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_settings(&self, settings: ScanSettings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.inner.registry
    }

    /// Starts one cycle: a thread per enabled in-process source plus one for
    /// the worker session. Returns immediately.
    pub fn start_cycle(&self) -> CycleHandle {
        let settings = self.settings();
        let (tx, rx) = mpsc::channel();
        let ctx = Arc::new(ScanContext::new(&settings.excluded_processes));

        let enabled: Vec<&Arc<dyn WindowSource>> = self
            .inner
            .registry
            .all()
            .iter()
            .filter(|s| settings.is_enabled(s.name()))
            .collect();
        let handled = Arc::new(handled_processes(enabled.iter().map(|s| s.descriptor())));
        let mut expected = Vec::new();

        for source in enabled
            .iter()
            .filter(|s| s.descriptor().mode == ExecutionMode::InProcess)
        {
            expected.push(source.name().to_string());
            self.spawn_in_process(Arc::clone(*source), &ctx, &handled, tx.clone());
        }

        let isolated: Vec<SourceDescriptor> = enabled
            .iter()
            .filter(|s| s.descriptor().mode == ExecutionMode::Isolated)
            .map(|s| s.descriptor().clone())
            .collect();
        if !isolated.is_empty() {
            expected.extend(isolated.iter().map(|d| d.name.clone()));
            self.spawn_isolated(isolated, settings, &ctx, &handled, tx.clone());
        }

        drop(tx);
        CycleHandle { rx, expected }
    }

    /// Drains one cycle on the calling thread, the single owner of the
    /// reconciled list. `on_update` sees every non-empty operation batch.
    pub fn run_cycle<F>(&self, reconciler: &mut Reconciler, mut on_update: F) -> CycleSummary
    where
        F: FnMut(&SourceReport, &[ListOp]),
    {
        let handle = self.start_cycle();
        let deadline = Instant::now() + self.settings().worker_timeout + DRAIN_GRACE;
        let mut summary = CycleSummary::default();

        for source in self.retired_sources(reconciler) {
            let ops = reconciler.remove_source(&source);
            self.inner
                .logger
                .info(format!("{source}: removed {} row(s) of a retired source", ops.len()));
            summary.operations += ops.len();
            if !ops.is_empty() {
                let report = SourceReport {
                    mode: self
                        .inner
                        .registry
                        .get(&source)
                        .map_or(ExecutionMode::InProcess, |s| s.descriptor().mode),
                    source: source.clone(),
                    records: Vec::new(),
                    status: ScanStatus::Fresh,
                };
                on_update(&report, &ops);
            }
            summary.retired.push(source);
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.recv_timeout(remaining) {
                // A failed source leaves its rows exactly as they are.
                Ok(CycleEvent::Source(report)) => {
                    if matches!(report.status, ScanStatus::Failed(_)) {
                        summary.failed.push(report.source.clone());
                    } else {
                        let ops = reconciler.apply(&report.source, report.records.clone());
                        summary.operations += ops.len();
                        if !ops.is_empty() {
                            on_update(&report, &ops);
                        }
                    }
                    summary.reported.push(report.source);
                }
                Ok(CycleEvent::Worker(report)) => summary.worker = Some(report),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.inner.logger.warn(
                        "cycle drain deadline reached; leaving remaining sources for the next cycle",
                    );
                    break;
                }
            }
        }

        summary.pending = handle
            .expected_sources()
            .iter()
            .filter(|name| !summary.reported.contains(name))
            .cloned()
            .collect();
        summary
    }

    /// Sources with rows in `reconciler` that this cycle will never refresh.
    fn retired_sources(&self, reconciler: &Reconciler) -> Vec<String> {
        let settings = self.settings();
        let mut retired: Vec<String> = Vec::new();
        for record in reconciler.items() {
            let id = record.source_id.as_str();
            let live = self.inner.registry.get(id).is_some() && settings.is_enabled(id);
            if !live && !retired.iter().any(|r| r == id) {
                retired.push(id.to_string());
            }
        }
        retired
    }

    fn spawn_in_process(
        &self,
        source: Arc<dyn WindowSource>,
        ctx: &Arc<ScanContext>,
        handled: &Arc<HashSet<String>>,
        tx: Sender<CycleEvent>,
    ) {
        let name = source.name().to_string();
        let Some(cache) = self.inner.caches.get(&name).cloned() else {
            self.inner
                .logger
                .error(format!("{name}: no scan cache registered"));
            return;
        };
        let ctx = Arc::clone(ctx);
        let handled = Arc::clone(handled);
        let logger = self.inner.logger.clone();

        let spawned = thread::Builder::new()
            .name(format!("scan-{name}"))
            .spawn(move || {
                let outcome = cache.scan(|| {
                    source
                        .scan(&ctx)
                        .map(|facts| attribute(source.name(), &ctx, facts))
                });
                let records =
                    suppress_handled(source.descriptor(), &handled, outcome.snapshot.to_vec());
                logger.debug(format!(
                    "{}: {} record(s) ({:?})",
                    source.name(),
                    records.len(),
                    outcome.status
                ));
                let _ = tx.send(CycleEvent::Source(SourceReport {
                    source: source.name().to_string(),
                    mode: ExecutionMode::InProcess,
                    records,
                    status: outcome.status,
                }));
            });
        if let Err(error) = spawned {
            self.inner
                .logger
                .error(format!("{name}: failed to start scan thread: {error}"));
        }
    }

    fn spawn_isolated(
        &self,
        descriptors: Vec<SourceDescriptor>,
        settings: ScanSettings,
        ctx: &Arc<ScanContext>,
        handled: &Arc<HashSet<String>>,
        tx: Sender<CycleEvent>,
    ) {
        let inner = Arc::clone(&self.inner);
        let ctx = Arc::clone(ctx);
        let handled = Arc::clone(handled);

        let spawned = thread::Builder::new()
            .name("scan-isolated".into())
            .spawn(move || run_isolated(&inner, &descriptors, &settings, &ctx, &handled, &tx));
        if let Err(error) = spawned {
            self.inner
                .logger
                .error(format!("failed to start worker session thread: {error}"));
        }
    }
}

fn run_isolated(
    inner: &Inner,
    descriptors: &[SourceDescriptor],
    settings: &ScanSettings,
    ctx: &ScanContext,
    handled: &HashSet<String>,
    tx: &Sender<CycleEvent>,
) {
    let by_name: HashMap<&str, &SourceDescriptor> =
        descriptors.iter().map(|d| (d.name.as_str(), d)).collect();
    let request = WorkerRequest::scan(descriptors.iter().map(|d| d.name.clone()).collect())
        .excluding(settings.excluded_processes.clone())
        .disabling(settings.disabled_sources.iter().cloned().collect());

    let forward = |name: &str, records: Vec<WindowRecord>, status: ScanStatus| {
        let records = match by_name.get(name) {
            Some(descriptor) => suppress_handled(descriptor, handled, records),
            None => records,
        };
        let _ = tx.send(CycleEvent::Source(SourceReport {
            source: name.to_string(),
            mode: ExecutionMode::Isolated,
            records,
            status,
        }));
    };

    let mut session_report = None;
    let outcome = inner.worker_gate.scan(|| {
        let Some(command) = inner.worker_command.clone() else {
            return Err(SourceError::Worker("no worker command configured".into()));
        };
        let mut snapshot: IsolatedSnapshot = (*inner.worker_gate.snapshot()).clone();
        let session = WorkerSession::new(command, settings.worker_timeout, inner.logger.clone());

        let report = session.run(&request, |message: WorkerResultMessage| {
            let name = message.plugin_name;
            if !by_name.contains_key(name.as_str()) {
                inner
                    .logger
                    .warn(format!("worker reported unrequested source '{name}'"));
                return;
            }
            match message.error {
                Some(error) => {
                    let stale = snapshot.get(&name).cloned().unwrap_or_default();
                    forward(&name, stale, ScanStatus::Failed(SourceError::Scan(error)));
                }
                None => {
                    let records = attribute(&name, ctx, message.windows);
                    snapshot.insert(name.clone(), records.clone());
                    forward(&name, records, ScanStatus::Fresh);
                }
            }
        });

        let spawn_error = match &report.state {
            SessionState::SpawnFailed(error) => Some(error.clone()),
            _ => None,
        };
        session_report = Some(report);
        match spawn_error {
            Some(error) => Err(SourceError::Worker(error)),
            None => Ok(snapshot),
        }
    });

    if outcome.status == ScanStatus::Coalesced {
        for descriptor in descriptors {
            if let Some(records) = outcome.snapshot.get(&descriptor.name) {
                forward(&descriptor.name, records.clone(), ScanStatus::Coalesced);
            }
        }
    }

    if let Some(report) = session_report {
        inner.logger.info(format!(
            "worker session {} in {}ms ({} source(s) reported, {} malformed line(s))",
            report.state,
            report.elapsed.as_millis(),
            report.delivered.len(),
            report.malformed_lines
        ));
        let _ = tx.send(CycleEvent::Worker(report));
    }
}
