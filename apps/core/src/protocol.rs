//! Host/worker wire format: newline-delimited UTF-8 JSON.
//!
//! The host writes one [`WorkerRequest`] line to the worker's stdin. The
//! worker answers with one [`WorkerResultMessage`] line per finished source
//! on stdout, then a single `{"isFinal":true}` sentinel.

use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

use crate::model::WindowFacts;

pub const SCAN_COMMAND: &str = "scan";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub command: String,
    /// Isolated sources to run; empty means all of them.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub excluded_processes: Vec<String>,
    #[serde(default)]
    pub disabled_plugins: Vec<String>,
}

impl WorkerRequest {
    pub fn scan(plugins: Vec<String>) -> Self {
        Self {
            command: SCAN_COMMAND.to_string(),
            plugins,
            excluded_processes: Vec::new(),
            disabled_plugins: Vec::new(),
        }
    }

    pub fn excluding(mut self, processes: Vec<String>) -> Self {
        self.excluded_processes = processes;
        self
    }

    pub fn disabling(mut self, plugins: Vec<String>) -> Self {
        self.disabled_plugins = plugins;
        self
    }
}

/// Result lines always carry `pluginName` and `windows`; the sentinel is
/// just `{"isFinal":true}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResultMessage {
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default)]
    pub windows: Vec<WindowFacts>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub is_final: bool,
}

impl WorkerResultMessage {
    pub fn windows(plugin_name: &str, windows: Vec<WindowFacts>) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            windows,
            ..Default::default()
        }
    }

    pub fn failed(plugin_name: &str, error: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn sentinel() -> Self {
        Self {
            is_final: true,
            ..Default::default()
        }
    }
}

impl Serialize for WorkerResultMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_final {
            let mut state = serializer.serialize_struct("WorkerResultMessage", 1)?;
            state.serialize_field("isFinal", &true)?;
            return state.end();
        }

        let len = 2 + usize::from(self.error.is_some());
        let mut state = serializer.serialize_struct("WorkerResultMessage", len)?;
        state.serialize_field("pluginName", &self.plugin_name)?;
        state.serialize_field("windows", &self.windows)?;
        if let Some(error) = &self.error {
            state.serialize_field("error", error)?;
        }
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    Result(WorkerResultMessage),
    Final,
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("result message without pluginName")]
    MissingPluginName,
    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Classifies one raw line read from the worker's stdout. Trailing `\r\n`
/// or `\n` is ignored.
pub fn decode_line(raw: &[u8]) -> Result<WorkerLine, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(WorkerLine::Blank);
    }

    let message: WorkerResultMessage =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if message.is_final {
        return Ok(WorkerLine::Final);
    }
    if message.plugin_name.trim().is_empty() {
        return Err(ProtocolError::MissingPluginName);
    }
    Ok(WorkerLine::Result(message))
}

pub fn decode_request(raw: &str) -> Result<WorkerRequest, ProtocolError> {
    let request: WorkerRequest =
        serde_json::from_str(raw.trim()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if request.command != SCAN_COMMAND {
        return Err(ProtocolError::UnsupportedCommand(request.command));
    }
    Ok(request)
}
