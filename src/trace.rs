//! Structured trace records.
//!
//! A trace file is newline-delimited JSON, one event per line, appended by
//! the external instrumentation. Records are immutable once parsed; the only
//! mutation this crate performs is attaching derived source mappings to
//! compilation payloads for the visualization layer.

use crate::args::ArgumentDescriptor;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open trace file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not read line {line} of trace file {path:?}")]
    Read {
        path: PathBuf,
        line: usize,
        source: std::io::Error,
    },
    #[error("malformed trace record at line {line}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// Tag of one trace record.
///
/// Tags this crate does not interpret are carried verbatim so that
/// re-emitting a trace never rewrites them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Launch,
    Compilation,
    Other(String),
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Launch => "launch",
            Self::Compilation => "compilation",
            Self::Other(tag) => tag,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "launch" => Self::Launch,
            "compilation" => Self::Compilation,
            _ => Self::Other(tag),
        })
    }
}

/// Compilation settings recorded with a launch, including the `hash`
/// correlation key back to the compilation event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_warps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_stages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triton_version: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

/// The original kernel source as captured at compile time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PythonSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

/// Free-form event payload. Compilation events carry the full text of every
/// generated artifact in `file_content`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub file_content: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub file_path: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_source: Option<PythonSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<KernelMetadata>,
    /// Derived per-dialect source maps, attached by
    /// [`augment_source_mappings`].
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub source_mappings: IndexMap<String, serde_json::Value>,
    /// Derived IR structure analysis, attached by [`augment_ir_analysis`].
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub ir_analysis: IndexMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

/// One record of the append-only trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_type: EventType,
    /// Content hash identifying a compilation event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Launch grid, present for launch events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compilation_metadata: Option<CompilationMetadata>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extracted_args: IndexMap<String, ArgumentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl Default for EventType {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl TraceEvent {
    /// The compilation hash a launch event correlates through.
    #[must_use]
    pub fn compilation_hash(&self) -> Option<&str> {
        self.compilation_metadata
            .as_ref()
            .and_then(|meta| meta.hash.as_deref())
    }
}

/// Parse an in-memory NDJSON trace. Blank lines are skipped.
pub fn parse_events(text: &str) -> Result<Vec<TraceEvent>, Error> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(line).map_err(|source| Error::Parse {
            line: idx + 1,
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Read and parse an NDJSON trace file.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, Error> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = std::io::BufReader::new(file);

    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| Error::Read {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|source| Error::Parse {
            line: idx + 1,
            source,
        })?;
        events.push(event);
    }
    log::debug!("loaded {} events from {}", events.len(), path.display());
    Ok(events)
}

/// Attach derived source mappings to a compilation event's payload.
///
/// Launch and other events are left untouched.
pub fn augment_source_mappings(event: &mut TraceEvent) {
    if event.event_type != EventType::Compilation {
        return;
    }
    let Some(payload) = &mut event.payload else {
        return;
    };
    payload.source_mappings = crate::sourcemap::extract_all(&payload.file_content);
}

/// Attach derived IR structure analysis to a compilation event's payload.
///
/// Launch and other events are left untouched.
pub fn augment_ir_analysis(event: &mut TraceEvent) {
    if event.event_type != EventType::Compilation {
        return;
    }
    let Some(payload) = &mut event.payload else {
        return;
    };
    let analysis = crate::ir_analysis::analyze(payload);
    payload.ir_analysis = analysis;
}

#[cfg(test)]
mod tests {
    use super::{augment_ir_analysis, augment_source_mappings, parse_events, Error, EventType};
    use similar_asserts as diff;

    #[test]
    fn parses_heterogeneous_events() {
        let trace = r#"{"event_type": "compilation", "hash": "abc", "payload": {"file_content": {}}}
{"event_type": "launch", "grid": [64, 1, 1], "compilation_metadata": {"hash": "abc", "num_warps": 4}}

{"event_type": "allocation", "pid": 1}
"#;
        let events = parse_events(trace).unwrap();
        diff::assert_eq!(have: events.len(), want: 3);
        diff::assert_eq!(have: events[0].event_type, want: EventType::Compilation);
        diff::assert_eq!(have: events[1].event_type, want: EventType::Launch);
        diff::assert_eq!(have: events[1].compilation_hash(), want: Some("abc"));
        diff::assert_eq!(have: events[1].grid.as_deref(), want: Some(&[64, 1, 1][..]));
        // unknown tags are preserved, not rejected
        diff::assert_eq!(
            have: events[2].event_type,
            want: EventType::Other("allocation".to_string())
        );
    }

    #[test]
    fn unknown_event_tags_survive_reserialization() {
        let line = r#"{"event_type": "allocation", "pid": 1}"#;
        let events = parse_events(line).unwrap();
        let emitted = serde_json::to_value(&events[0]).unwrap();
        diff::assert_eq!(have: emitted["event_type"].as_str().unwrap(), want: "allocation");
        diff::assert_eq!(have: emitted["pid"].as_u64().unwrap(), want: 1);
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let trace = "{\"event_type\": \"launch\"}\nnot json\n";
        let err = parse_events(trace).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 2, .. }), "{err}");
    }

    #[test]
    fn augment_attaches_mappings_to_compilation_events() {
        let trace = concat!(
            r#"{"event_type": "compilation", "hash": "abc", "payload": {"file_content": {"#,
            r#""k.sass": "\t//## File \"/src/k.py\", line 10\n        /*0000*/ MOV R1, R2 ;\n""#,
            r#"}}}"#,
            "\n"
        );
        let mut events = parse_events(trace).unwrap();
        augment_source_mappings(&mut events[0]);
        let payload = events[0].payload.as_ref().unwrap();
        let sass = &payload.source_mappings["sass"];
        diff::assert_eq!(have: sass["2"]["line"].as_u64().unwrap(), want: 10);

        // launch events are untouched
        let mut launch = super::TraceEvent {
            event_type: EventType::Launch,
            ..Default::default()
        };
        augment_source_mappings(&mut launch);
        assert!(launch.payload.is_none());
    }

    #[test]
    fn augment_attaches_ir_analysis_to_compilation_events() {
        let trace = concat!(
            r#"{"event_type": "compilation", "hash": "abc", "payload": {"file_content": {"#,
            r#""k.ttgir": "scf.for %i = %c0 to %c4 step %c1 {\n  %0 = tt.load %p\n}\n""#,
            r#"}}}"#,
            "\n",
            r#"{"event_type": "launch", "compilation_metadata": {"hash": "abc"}}"#,
            "\n"
        );
        let mut events = parse_events(trace).unwrap();
        for event in &mut events {
            augment_ir_analysis(event);
        }
        let payload = events[0].payload.as_ref().unwrap();
        diff::assert_eq!(
            have: payload.ir_analysis["loop_schedules"][0]["loop_bounds"]["start"]
                .as_u64()
                .unwrap(),
            want: 0
        );
        assert!(events[1].payload.is_none());
    }
}
