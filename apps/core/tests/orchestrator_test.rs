use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use switchscan_core::cache::ScanStatus;
use switchscan_core::discovery::{ScanContext, SourceError, SourceRegistry, StaticSource, WindowSource};
use switchscan_core::logging::Logger;
use switchscan_core::model::{ExecutionMode, SourceDescriptor, WindowFacts};
use switchscan_core::orchestrator::{CycleEvent, Orchestrator, ScanSettings};
use switchscan_core::reconciler::Reconciler;
use switchscan_core::worker_session::{SessionState, WorkerCommand};

fn settings(timeout_ms: u64) -> ScanSettings {
    ScanSettings {
        worker_timeout: Duration::from_millis(timeout_ms),
        disabled_sources: HashSet::new(),
        excluded_processes: vec!["explorer".into()],
    }
}

fn desktop() -> Arc<dyn WindowSource> {
    Arc::new(StaticSource::new(
        SourceDescriptor::new("Windows", ExecutionMode::InProcess),
        vec![
            WindowFacts::new(1, "Editor", "code"),
            WindowFacts::new(2, "Inbox - Gmail", "chrome"),
            WindowFacts::new(3, "Downloads", "explorer"),
        ],
    ))
}

fn titles(reconciler: &Reconciler) -> Vec<String> {
    reconciler.items().iter().map(|r| r.title.clone()).collect()
}

/// Fails every scan after the first.
struct FlakySource {
    descriptor: SourceDescriptor,
    calls: AtomicUsize,
}

impl WindowSource for FlakySource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn scan(&self, _ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(vec![WindowFacts::new(10, "Chat", "teams")])
        } else {
            Err(SourceError::scan("tree unavailable"))
        }
    }
}

struct SlowSource {
    descriptor: SourceDescriptor,
    calls: AtomicUsize,
}

impl WindowSource for SlowSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn scan(&self, _ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(400));
        Ok(vec![WindowFacts::new(20, "Slow window", "slow")])
    }
}

#[test]
fn in_process_cycle_filters_excluded_processes() {
    let registry = SourceRegistry::new().with(desktop()).unwrap();
    let orchestrator = Orchestrator::new(registry, settings(1_000), Logger::disabled());
    let mut reconciler = Reconciler::new();

    let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});

    assert_eq!(titles(&reconciler), vec!["Editor", "Inbox - Gmail"]);
    assert_eq!(summary.reported, vec!["Windows".to_string()]);
    assert!(summary.failed.is_empty());
    assert!(summary.pending.is_empty());
    assert!(reconciler.items().iter().all(|r| r.source_id == "Windows"));
}

#[test]
fn handled_processes_are_suppressed_from_generic_sources() {
    let tabs: Arc<dyn WindowSource> = Arc::new(StaticSource::new(
        SourceDescriptor::new("Chrome", ExecutionMode::InProcess).handling(&["chrome.exe"]),
        vec![
            WindowFacts::new(2, "Inbox - Gmail", "chrome"),
            WindowFacts::new(2, "Docs", "chrome"),
        ],
    ));
    let registry = SourceRegistry::new().with(desktop()).unwrap().with(tabs).unwrap();
    let orchestrator = Orchestrator::new(registry, settings(1_000), Logger::disabled());
    let mut reconciler = Reconciler::new();

    orchestrator.run_cycle(&mut reconciler, |_, _| {});

    let mut all = titles(&reconciler);
    all.sort();
    assert_eq!(all, vec!["Docs", "Editor", "Inbox - Gmail"]);
    let generic: Vec<_> = reconciler
        .items()
        .iter()
        .filter(|r| r.source_id == "Windows")
        .map(|r| r.title.clone())
        .collect();
    assert_eq!(generic, vec!["Editor"]);
}

#[test]
fn disabled_sources_are_skipped() {
    let registry = SourceRegistry::new().with(desktop()).unwrap();
    let mut disabled = settings(1_000);
    disabled.disabled_sources.insert("Windows".into());
    let orchestrator = Orchestrator::new(registry, settings(1_000), Logger::disabled());
    orchestrator.update_settings(disabled);
    let mut reconciler = Reconciler::new();

    let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});

    assert!(reconciler.is_empty());
    assert!(summary.reported.is_empty());
}

#[test]
fn disabling_a_source_removes_its_rows_on_the_next_cycle() {
    let teams: Arc<dyn WindowSource> = Arc::new(StaticSource::new(
        SourceDescriptor::new("Teams", ExecutionMode::InProcess),
        vec![WindowFacts::new(10, "Chat", "teams")],
    ));
    let registry = SourceRegistry::new()
        .with(teams)
        .unwrap()
        .with(desktop())
        .unwrap();
    let orchestrator = Orchestrator::new(registry, settings(1_000), Logger::disabled());
    let mut reconciler = Reconciler::new();
    orchestrator.run_cycle(&mut reconciler, |_, _| {});
    assert!(titles(&reconciler).contains(&"Chat".to_string()));

    let mut disabled = settings(1_000);
    disabled.disabled_sources.insert("Teams".into());
    orchestrator.update_settings(disabled);
    let mut removed = Vec::new();
    let summary = orchestrator.run_cycle(&mut reconciler, |report, ops| {
        if report.source == "Teams" {
            removed.extend(ops.iter().cloned());
        }
    });

    assert_eq!(summary.retired, vec!["Teams".to_string()]);
    assert_eq!(removed.len(), 1);
    assert!(reconciler.items().iter().all(|r| r.source_id != "Teams"));
    assert_eq!(titles(&reconciler), vec!["Editor", "Inbox - Gmail"]);

    let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});
    assert!(summary.retired.is_empty());
    assert_eq!(summary.operations, 0);
}

#[test]
fn failing_source_keeps_stale_records_without_list_churn() {
    let flaky: Arc<dyn WindowSource> = Arc::new(FlakySource {
        descriptor: SourceDescriptor::new("Teams", ExecutionMode::InProcess),
        calls: AtomicUsize::new(0),
    });
    let registry = SourceRegistry::new().with(desktop()).unwrap().with(flaky).unwrap();
    let orchestrator = Orchestrator::new(registry, settings(1_000), Logger::disabled());
    let mut reconciler = Reconciler::new();

    orchestrator.run_cycle(&mut reconciler, |_, _| {});
    let before: Vec<_> = reconciler.items().to_vec();

    let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});

    assert_eq!(summary.failed, vec!["Teams".to_string()]);
    assert_eq!(summary.operations, 0);
    assert_eq!(reconciler.len(), before.len());
    assert!(reconciler
        .items()
        .iter()
        .zip(&before)
        .all(|(a, b)| Arc::ptr_eq(a, b)));
}

#[test]
fn overlapping_cycles_coalesce_per_source() {
    let slow = Arc::new(SlowSource {
        descriptor: SourceDescriptor::new("Slow", ExecutionMode::InProcess),
        calls: AtomicUsize::new(0),
    });
    let registry = SourceRegistry::new()
        .with(slow.clone() as Arc<dyn WindowSource>)
        .unwrap();
    let orchestrator = Orchestrator::new(registry, settings(1_000), Logger::disabled());

    let first = orchestrator.start_cycle();
    thread::sleep(Duration::from_millis(100));
    let second = orchestrator.start_cycle();

    let second_events: Vec<_> = second.events().collect();
    let first_events: Vec<_> = first.events().collect();

    let status = |events: &[CycleEvent]| match &events[0] {
        CycleEvent::Source(report) => (report.status.clone(), report.records.len()),
        CycleEvent::Worker(_) => panic!("no worker in this cycle"),
    };
    assert_eq!(status(&second_events), (ScanStatus::Coalesced, 0));
    assert_eq!(status(&first_events), (ScanStatus::Fresh, 1));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_worker_does_not_abort_the_cycle() {
    let isolated: Arc<dyn WindowSource> = Arc::new(StaticSource::new(
        SourceDescriptor::new("Chrome", ExecutionMode::Isolated),
        Vec::new(),
    ));
    let registry = SourceRegistry::new().with(desktop()).unwrap().with(isolated).unwrap();
    let orchestrator = Orchestrator::with_worker(
        registry,
        settings(1_000),
        WorkerCommand::new("/nonexistent/switchscan-worker", &["worker"]),
        Logger::disabled(),
    );
    let mut reconciler = Reconciler::new();

    let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});

    assert_eq!(titles(&reconciler), vec!["Editor", "Inbox - Gmail"]);
    assert_eq!(summary.pending, vec!["Chrome".to_string()]);
    let worker = summary.worker.expect("worker report");
    assert!(matches!(worker.state, SessionState::SpawnFailed(_)));
}

#[cfg(unix)]
mod isolated {
    use super::*;

    fn isolated(name: &str) -> Arc<dyn WindowSource> {
        Arc::new(StaticSource::new(
            SourceDescriptor::new(name, ExecutionMode::Isolated),
            Vec::new(),
        ))
    }

    fn fake_worker(body: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh", &["-c", &format!("read -r request\n{body}")])
    }

    const FAST: &str = r#"{"pluginName":"Fast","windows":[{"hwnd":5,"title":"Fast tab","processName":"fastapp"},{"hwnd":6,"title":"Hidden","processName":"explorer"}]}"#;
    const SLOW: &str = r#"{"pluginName":"Slow","windows":[{"hwnd":7,"title":"Slow tab","processName":"slowapp"}]}"#;
    const FINAL: &str = r#"{"isFinal":true}"#;

    fn orchestrator(body: &str, timeout_ms: u64) -> Orchestrator {
        let registry = SourceRegistry::new()
            .with(desktop())
            .unwrap()
            .with(isolated("Fast"))
            .unwrap()
            .with(isolated("Slow"))
            .unwrap();
        Orchestrator::with_worker(
            registry,
            settings(timeout_ms),
            fake_worker(body),
            Logger::disabled(),
        )
    }

    #[test]
    fn isolated_results_pop_in_as_they_arrive() {
        let body = format!("echo '{FAST}'\nsleep 1\necho '{SLOW}'\necho '{FINAL}'");
        let orchestrator = orchestrator(&body, 60_000);
        let mut reconciler = Reconciler::new();
        let mut arrivals = Vec::new();

        let summary = orchestrator.run_cycle(&mut reconciler, |report, _| {
            arrivals.push(report.source.clone())
        });

        let fast_at = arrivals.iter().position(|s| s == "Fast").unwrap();
        let slow_at = arrivals.iter().position(|s| s == "Slow").unwrap();
        assert!(fast_at < slow_at);
        let mut all = titles(&reconciler);
        all.sort();
        assert_eq!(all, vec!["Editor", "Fast tab", "Inbox - Gmail", "Slow tab"]);
        assert_eq!(summary.worker.unwrap().state, SessionState::Completed);
        assert!(summary.pending.is_empty());
    }

    #[test]
    fn timed_out_sources_contribute_nothing() {
        let body = format!("echo '{FAST}'\nexec sleep 30");
        let orchestrator = orchestrator(&body, 300);
        let mut reconciler = Reconciler::new();

        let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});

        let isolated: Vec<_> = reconciler
            .items()
            .iter()
            .filter(|r| r.source_id == "Fast" || r.source_id == "Slow")
            .map(|r| r.title.clone())
            .collect();
        assert_eq!(isolated, vec!["Fast tab"]);
        assert_eq!(summary.pending, vec!["Slow".to_string()]);
        assert_eq!(summary.worker.unwrap().state, SessionState::TimedOut);
    }

    #[test]
    fn worker_error_message_keeps_previous_rows() {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let marker = std::env::temp_dir().join(format!("switchscan-second-run-{unique}"));
        let failed = r#"{"pluginName":"Slow","error":"tree walk failed"}"#;
        let body = format!(
            "if [ -e '{m}' ]; then\necho '{FAST}'\necho '{failed}'\nelse\ntouch '{m}'\necho '{FAST}'\necho '{SLOW}'\nfi\necho '{FINAL}'",
            m = marker.display()
        );
        let orchestrator = orchestrator(&body, 60_000);
        let mut reconciler = Reconciler::new();

        orchestrator.run_cycle(&mut reconciler, |_, _| {});
        let before: Vec<_> = reconciler.items().to_vec();
        assert_eq!(before.len(), 4);

        let summary = orchestrator.run_cycle(&mut reconciler, |_, _| {});

        assert_eq!(summary.failed, vec!["Slow".to_string()]);
        assert_eq!(summary.operations, 0);
        assert!(reconciler
            .items()
            .iter()
            .zip(&before)
            .all(|(a, b)| Arc::ptr_eq(a, b)));

        std::fs::remove_file(&marker).unwrap();
    }
}
