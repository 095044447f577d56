use serde::{Deserialize, Serialize};

/// Opaque platform window identifier (an `HWND` value on Windows).
///
/// Not unique across records: every tab discovered inside one browser window
/// shares that window's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub isize);

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What a scan reports about one window, before attribution to a source.
/// This is also the per-window shape of the worker transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowFacts {
    pub hwnd: WindowHandle,
    pub title: String,
    #[serde(default)]
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
}

impl WindowFacts {
    pub fn new(hwnd: isize, title: &str, process_name: &str) -> Self {
        Self {
            hwnd: WindowHandle(hwnd),
            title: title.to_string(),
            process_name: process_name.to_string(),
            executable_path: None,
        }
    }

    pub fn with_executable_path(mut self, path: &str) -> Self {
        self.executable_path = Some(path.to_string());
        self
    }
}

/// `(Handle, Title)`: two records are the same entity across cycles iff
/// this pair matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub handle: WindowHandle,
    pub title: String,
}

/// One discoverable, activatable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    pub handle: WindowHandle,
    pub title: String,
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    pub source_id: String,
    /// Assigned downstream by ranking; always `None` when produced here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut_index: Option<u8>,
}

impl WindowRecord {
    pub fn from_facts(facts: WindowFacts, source_id: &str) -> Self {
        debug_assert!(!source_id.is_empty());
        Self {
            handle: facts.hwnd,
            title: facts.title,
            process_name: facts.process_name,
            executable_path: facts.executable_path,
            source_id: source_id.to_string(),
            shortcut_index: None,
        }
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            handle: self.handle,
            title: self.title.clone(),
        }
    }

    pub fn same_identity(&self, other: &WindowRecord) -> bool {
        self.handle == other.handle && self.title == other.title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    InProcess,
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub mode: ExecutionMode,
    /// Processes whose windows this source reports in its own way; generic
    /// sources suppress their entries for these.
    pub handled_process_names: Vec<String>,
}

impl SourceDescriptor {
    pub fn new(name: &str, mode: ExecutionMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            handled_process_names: Vec::new(),
        }
    }

    pub fn handling(mut self, process_names: &[&str]) -> Self {
        self.handled_process_names = process_names
            .iter()
            .map(|name| normalize_process_name(name))
            .collect();
        self
    }

    pub fn is_generic(&self) -> bool {
        self.handled_process_names.is_empty()
    }
}

/// Lowercases and strips a trailing `.exe`, so `Chrome.exe` and `chrome`
/// compare equal.
pub fn normalize_process_name(input: &str) -> String {
    let lowered = input.trim().to_ascii_lowercase();
    match lowered.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lowered,
    }
}
