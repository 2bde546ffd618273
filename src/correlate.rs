//! Correlation of launch events with their compilation events.
//!
//! A launch refers to its compilation through a content hash. Correlation is
//! strict: a missing or ambiguous match is an error, never resolved
//! arbitrarily.

use crate::trace::{EventType, TraceEvent};
use serde::Serialize;

/// Marker that opens the reproducible unit of kernel source; any framework
/// boilerplate before it is stripped.
pub const KERNEL_MARKER: &str = "@triton.jit";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid event index {index}: trace has {len} events")]
    InvalidIndex { index: usize, len: usize },
    #[error("event at index {index} is not a launch event (found {found})")]
    NotALaunch { index: usize, found: EventType },
    #[error("could not find compilation hash in launch event at index {index}")]
    MissingHash { index: usize },
    #[error("could not find compilation event for hash {hash}")]
    CompilationNotFound { hash: String },
    #[error("expected 1 compilation event for hash {hash}, got {count}")]
    AmbiguousCompilation { hash: String, count: usize },
    #[error(
        "could not resolve kernel file path or function name from compilation event"
    )]
    UnresolvedKernel,
}

/// Identity of a compiled kernel, derived from one compilation event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelInfo {
    pub file_path: String,
    pub function_name: String,
    pub source_code: String,
    pub call_stack: Vec<serde_json::Value>,
}

/// Locate the launch event at `index` and its unique matching compilation
/// event.
///
/// Pure function of its inputs: calling it twice with the same arguments
/// returns the same pair.
pub fn correlate(
    events: &[TraceEvent],
    index: usize,
) -> Result<(&TraceEvent, &TraceEvent), Error> {
    let launch = events.get(index).ok_or(Error::InvalidIndex {
        index,
        len: events.len(),
    })?;
    if launch.event_type != EventType::Launch {
        return Err(Error::NotALaunch {
            index,
            found: launch.event_type.clone(),
        });
    }
    let hash = launch
        .compilation_hash()
        .ok_or(Error::MissingHash { index })?;

    let matches: Vec<&TraceEvent> = events
        .iter()
        .filter(|event| {
            event.event_type == EventType::Compilation && event.hash.as_deref() == Some(hash)
        })
        .collect();
    match matches.as_slice() {
        [] => Err(Error::CompilationNotFound {
            hash: hash.to_string(),
        }),
        [compilation] => Ok((launch, compilation)),
        _ => Err(Error::AmbiguousCompilation {
            hash: hash.to_string(),
            count: matches.len(),
        }),
    }
}

/// Extract kernel identity from a compilation event.
///
/// The returned source is truncated to start at [`KERNEL_MARKER`]; the
/// correlation cannot proceed without both a file path and a function name.
pub fn extract_kernel_info(compilation: &TraceEvent) -> Result<KernelInfo, Error> {
    let payload = compilation.payload.as_ref();
    let python_source = payload.and_then(|p| p.python_source.as_ref());

    let file_path = python_source.and_then(|s| s.file_path.clone());
    let function_name = payload
        .and_then(|p| p.metadata.as_ref())
        .and_then(|m| m.name.clone());

    let mut source_code = python_source
        .and_then(|s| s.code.clone())
        .unwrap_or_default();
    if let Some(position) = source_code.find(KERNEL_MARKER) {
        source_code = source_code.split_off(position);
        log::debug!("extracted kernel source starting from {KERNEL_MARKER:?}");
    }

    let (Some(file_path), Some(function_name)) = (file_path, function_name) else {
        return Err(Error::UnresolvedKernel);
    };
    Ok(KernelInfo {
        file_path,
        function_name,
        source_code,
        call_stack: compilation.stack.clone(),
    })
}
