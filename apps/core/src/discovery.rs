use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{
    normalize_process_name, ExecutionMode, SourceDescriptor, WindowFacts, WindowRecord,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Scan(String),
    #[error("scan panicked: {0}")]
    Panicked(String),
    #[error("worker: {0}")]
    Worker(String),
}

impl SourceError {
    pub fn scan(message: impl Into<String>) -> Self {
        Self::Scan(message.into())
    }
}

/// Per-cycle inputs handed to every scan.
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    excluded_processes: HashSet<String>,
}

impl ScanContext {
    pub fn new<I, S>(excluded_processes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            excluded_processes: excluded_processes
                .into_iter()
                .map(|name| normalize_process_name(name.as_ref()))
                .collect(),
        }
    }

    pub fn is_excluded(&self, process_name: &str) -> bool {
        !self.excluded_processes.is_empty()
            && self
                .excluded_processes
                .contains(&normalize_process_name(process_name))
    }

    pub fn retain_allowed(&self, windows: &mut Vec<WindowFacts>) {
        windows.retain(|w| !self.is_excluded(&w.process_name));
    }
}

/// One discovery unit. Where it runs is decided by its descriptor's
/// [`ExecutionMode`]; isolated sources must keep no state between calls.
pub trait WindowSource: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;
    fn scan(&self, ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

/// Attributes scanned facts to `source` after dropping excluded processes.
pub fn attribute(source: &str, ctx: &ScanContext, facts: Vec<WindowFacts>) -> Vec<WindowRecord> {
    facts
        .into_iter()
        .filter(|f| !ctx.is_excluded(&f.process_name))
        .map(|f| WindowRecord::from_facts(f, source))
        .collect()
}

/// Source that always reports the same windows.
pub struct StaticSource {
    descriptor: SourceDescriptor,
    windows: Vec<WindowFacts>,
}

impl StaticSource {
    pub fn new(descriptor: SourceDescriptor, windows: Vec<WindowFacts>) -> Self {
        Self {
            descriptor,
            windows,
        }
    }

    pub fn deterministic_fixture() -> Self {
        Self::new(
            SourceDescriptor::new("Fixture", ExecutionMode::InProcess),
            vec![
                WindowFacts::new(0x1001, "Visual Studio Code", "Code")
                    .with_executable_path("C:\\Program Files\\Microsoft VS Code\\Code.exe"),
                WindowFacts::new(0x1002, "Windows Terminal", "WindowsTerminal"),
            ],
        )
    }
}

impl WindowSource for StaticSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn scan(&self, _ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        Ok(self.windows.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("source name must be non-empty")]
    EmptyName,
    #[error("duplicate source name '{0}'")]
    Duplicate(String),
}

/// Static registration table. Built identically in the host and in the
/// worker process, so names line up across the process boundary.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn WindowSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn WindowSource>) -> Result<(), RegistryError> {
        let name = source.name().trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.get(name).is_some() {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn with(mut self, source: Arc<dyn WindowSource>) -> Result<Self, RegistryError> {
        self.register(source)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn WindowSource>> {
        self.sources.iter().find(|s| s.name() == name)
    }

    pub fn all(&self) -> &[Arc<dyn WindowSource>] {
        &self.sources
    }

    pub fn in_process(&self) -> impl Iterator<Item = &Arc<dyn WindowSource>> {
        self.by_mode(ExecutionMode::InProcess)
    }

    pub fn isolated(&self) -> impl Iterator<Item = &Arc<dyn WindowSource>> {
        self.by_mode(ExecutionMode::Isolated)
    }

    fn by_mode(&self, mode: ExecutionMode) -> impl Iterator<Item = &Arc<dyn WindowSource>> {
        self.sources
            .iter()
            .filter(move |s| s.descriptor().mode == mode)
    }
}

/// The built-in table shared by the host and the worker.
pub fn platform_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    let sources: [Arc<dyn WindowSource>; 2] = [
        Arc::new(crate::windows_enum::TopLevelWindowSource::default()),
        Arc::new(crate::windows_enum::MdiDocumentSource::default()),
    ];
    for source in sources {
        // Built-in names are fixed and distinct.
        let _ = registry.register(source);
    }
    registry
}

/// Process names claimed by the enabled non-generic sources.
pub fn handled_processes<'a, I>(descriptors: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a SourceDescriptor>,
{
    descriptors
        .into_iter()
        .flat_map(|d| d.handled_process_names.iter().cloned())
        .collect()
}

/// Drops generic entries for processes another source reports itself.
pub fn suppress_handled(
    descriptor: &SourceDescriptor,
    handled: &HashSet<String>,
    records: Vec<WindowRecord>,
) -> Vec<WindowRecord> {
    if !descriptor.is_generic() || handled.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| !handled.contains(&normalize_process_name(&r.process_name)))
        .collect()
}
