//! Source-mapping extraction from compiler-emitted artifacts.
//!
//! Each supported dialect embeds "original source location" annotations in
//! its own syntax; all of them are folded into one uniform per-line mapping
//! back to the original source file.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Placeholder files synthesized by the lowering passes.
///
/// Annotations referencing these never describe genuine source locations and
/// are skipped without touching the pending location.
const INTERNAL_FILES: &[&str] = &[".nv_debug_ptx_txt"];

fn is_internal_file(file: &str) -> bool {
    INTERNAL_FILES.contains(&file)
}

/// Artifact dialect, derived from the generated file's extension.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::Display, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sass,
    Ptx,
    Ttir,
    Ttgir,
}

impl Dialect {
    /// Detect the dialect from a generated-artifact filename.
    #[must_use]
    pub fn from_artifact_name(name: &str) -> Option<Self> {
        let ext = name.rsplit('.').next()?;
        match ext {
            "sass" => Some(Self::Sass),
            "ptx" => Some(Self::Ptx),
            "ttir" => Some(Self::Ttir),
            "ttgir" => Some(Self::Ttgir),
            _ => None,
        }
    }

    /// Field name under which the generated-line number is exported
    /// (`sass_line`, `ptx_line`, ...).
    #[must_use]
    pub fn line_key(&self) -> &'static str {
        match self {
            Self::Sass => "sass_line",
            Self::Ptx => "ptx_line",
            Self::Ttir => "ttir_line",
            Self::Ttgir => "ttgir_line",
        }
    }
}

/// One generated-code line mapped back to its original source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMapping {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// 1-based line number in the generated artifact.
    pub artifact_line: u32,
}

/// Mapping from 1-based generated-line number to source location.
pub type SourceMap = IndexMap<u32, SourceMapping>;

/// Extract per-line source mappings from one artifact's full text.
///
/// A file with no annotations yields an empty map.
#[must_use]
pub fn extract(dialect: Dialect, content: &str) -> SourceMap {
    match dialect {
        Dialect::Sass => extract_sass(content),
        Dialect::Ptx => extract_ptx(content),
        Dialect::Ttir | Dialect::Ttgir => extract_mlir(content),
    }
}

// e.g. `//## File "/path/to/kernel.py", line 188` (column is optional)
static SASS_ANNOTATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*//## File "(?P<file>[^"]+)", line (?P<line>\d+)(?::(?P<col>\d+))?"#).unwrap()
});

// instruction lines carry an address marker, e.g. `/*0010*/`
static SASS_ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/\*[0-9a-fA-F]+\*/").unwrap());

/// SASS: `//## File ...` comments set the pending location for all following
/// instruction lines until the next annotation. The last annotation before an
/// instruction wins; annotations never followed by an instruction produce
/// nothing.
fn extract_sass(content: &str) -> SourceMap {
    let mut mappings = SourceMap::new();
    let mut pending: Option<(String, u32, u32)> = None;

    for (idx, line) in content.lines().enumerate() {
        let artifact_line = (idx + 1) as u32;
        if let Some(captures) = SASS_ANNOTATION_REGEX.captures(line) {
            let file = &captures["file"];
            if is_internal_file(file) {
                // lowering-pass placeholder, keep the previous pending location
                continue;
            }
            pending = Some((
                file.to_string(),
                captures["line"].parse().unwrap_or(0),
                captures
                    .name("col")
                    .and_then(|c| c.as_str().parse().ok())
                    .unwrap_or(0),
            ));
        } else if SASS_ADDRESS_REGEX.is_match(line) {
            if let Some((file, line, column)) = &pending {
                mappings.insert(
                    artifact_line,
                    SourceMapping {
                        file: file.clone(),
                        line: *line,
                        column: *column,
                        artifact_line,
                    },
                );
            }
        }
    }
    mappings
}

// `.file 1 "/path/to/kernel.py"`
static PTX_FILE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*\.file\s+(?P<index>\d+)\s+"(?P<file>[^"]+)""#).unwrap());

// `.loc 1 42 17` (column is optional)
static PTX_LOC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\.loc\s+(?P<index>\d+)\s+(?P<line>\d+)(?:\s+(?P<col>\d+))?").unwrap()
});

/// PTX: `.file` directives build an index table, `.loc` directives set the
/// pending location. Instruction lines are recognized structurally: non-blank,
/// not a directive, not a comment, not a label or lone brace.
fn extract_ptx(content: &str) -> SourceMap {
    let mut file_table: IndexMap<u32, String> = IndexMap::new();
    for line in content.lines() {
        if let Some(captures) = PTX_FILE_REGEX.captures(line) {
            if let Ok(index) = captures["index"].parse() {
                file_table.insert(index, captures["file"].to_string());
            }
        }
    }

    let mut mappings = SourceMap::new();
    let mut pending: Option<(String, u32, u32)> = None;

    for (idx, line) in content.lines().enumerate() {
        let artifact_line = (idx + 1) as u32;
        if let Some(captures) = PTX_LOC_REGEX.captures(line) {
            let index: u32 = match captures["index"].parse() {
                Ok(index) => index,
                Err(_) => continue,
            };
            match file_table.get(&index) {
                Some(file) if !is_internal_file(file) => {
                    pending = Some((
                        file.clone(),
                        captures["line"].parse().unwrap_or(0),
                        captures
                            .name("col")
                            .and_then(|c| c.as_str().parse().ok())
                            .unwrap_or(0),
                    ));
                }
                _ => {}
            }
        } else if is_ptx_instruction(line) {
            if let Some((file, line, column)) = &pending {
                mappings.insert(
                    artifact_line,
                    SourceMapping {
                        file: file.clone(),
                        line: *line,
                        column: *column,
                        artifact_line,
                    },
                );
            }
        }
    }
    mappings
}

fn is_ptx_instruction(line: &str) -> bool {
    let trimmed = line.trim();
    !(trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.starts_with("//")
        || trimmed.starts_with('{')
        || trimmed.starts_with('}')
        || trimmed.starts_with('(')
        || trimmed.starts_with(')')
        || trimmed.ends_with(':'))
}

// `#loc3 = loc("/path/to/kernel.py":42:17)`
static MLIR_LOC_DEF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?P<key>#loc\d*)\s*=\s*loc\("(?P<file>[^"]+)":(?P<line>\d+)(?::(?P<col>\d+))?\)"#)
        .unwrap()
});

// trailing `loc(#loc3)` or inline `loc("/path":42:17)` reference
static MLIR_LOC_REF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"loc\((?:(?P<key>#loc\d*)|"(?P<file>[^"]+)":(?P<line>\d+)(?::(?P<col>\d+))?)\)\s*$"#,
    )
    .unwrap()
});

/// MLIR-style IR (TTIR/TTGIR): `#locN = loc(...)` definitions may appear
/// anywhere, code lines reference them with a trailing `loc(...)` annotation.
fn extract_mlir(content: &str) -> SourceMap {
    // pass 1: location definition table (definitions may trail their uses)
    let mut definitions: IndexMap<&str, (String, u32, u32)> = IndexMap::new();
    for line in content.lines() {
        if let Some(captures) = MLIR_LOC_DEF_REGEX.captures(line) {
            let key = captures.name("key").unwrap().as_str();
            definitions.insert(
                key,
                (
                    captures["file"].to_string(),
                    captures["line"].parse().unwrap_or(0),
                    captures
                        .name("col")
                        .and_then(|c| c.as_str().parse().ok())
                        .unwrap_or(0),
                ),
            );
        }
    }

    // pass 2: resolve per-line references
    let mut mappings = SourceMap::new();
    for (idx, line) in content.lines().enumerate() {
        let artifact_line = (idx + 1) as u32;
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with("#loc") || trimmed.starts_with("//") {
            continue;
        }
        let Some(captures) = MLIR_LOC_REF_REGEX.captures(line) else {
            continue;
        };
        let resolved = if let Some(key) = captures.name("key") {
            definitions.get(key.as_str()).cloned()
        } else {
            Some((
                captures["file"].to_string(),
                captures["line"].parse().unwrap_or(0),
                captures
                    .name("col")
                    .and_then(|c| c.as_str().parse().ok())
                    .unwrap_or(0),
            ))
        };
        let Some((file, line, column)) = resolved else {
            continue;
        };
        if is_internal_file(&file) {
            continue;
        }
        mappings.insert(
            artifact_line,
            SourceMapping {
                file,
                line,
                column,
                artifact_line,
            },
        );
    }
    mappings
}

/// Serialize one source map into the wire shape consumed by the visualization
/// layer: stringified line-number keys, and the artifact line exported under
/// the dialect-specific field name.
#[must_use]
pub fn to_json(dialect: Dialect, map: &SourceMap) -> serde_json::Value {
    let mut out = serde_json::Map::with_capacity(map.len());
    for (artifact_line, mapping) in map {
        let mut entry = serde_json::Map::with_capacity(4);
        entry.insert("file".to_string(), mapping.file.clone().into());
        entry.insert("line".to_string(), mapping.line.into());
        entry.insert("column".to_string(), mapping.column.into());
        entry.insert(
            dialect.line_key().to_string(),
            mapping.artifact_line.into(),
        );
        out.insert(artifact_line.to_string(), entry.into());
    }
    out.into()
}

/// Extract source mappings for every recognized artifact in a compilation
/// payload, keyed by dialect name.
#[must_use]
pub fn extract_all(
    file_content: &IndexMap<String, String>,
) -> IndexMap<String, serde_json::Value> {
    let mut out = IndexMap::new();
    for (name, content) in file_content {
        let Some(dialect) = Dialect::from_artifact_name(name) else {
            continue;
        };
        let map = extract(dialect, content);
        if map.is_empty() {
            continue;
        }
        log::debug!("extracted {} mappings from {name}", map.len());
        out.insert(dialect.to_string(), to_json(dialect, &map));
    }
    out
}
