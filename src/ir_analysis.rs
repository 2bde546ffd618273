//! Structural analysis of lowered IR text.
//!
//! Operates on the artifact text a compilation payload already carries:
//! loop-nest discovery over `scf.for` regions, memory-op counting for the
//! AMD backends, and a per-loop schedule of software-pipelining candidate
//! operations resolved back to the original kernel source.

use crate::sourcemap::{self, Dialect};
use crate::trace::{Payload, PythonSource};
use indexmap::IndexMap;
use serde::Serialize;

/// Inclusive range of one `scf.for` region, as 0-based line indices into the
/// artifact text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopBounds {
    pub start: usize,
    pub end: usize,
}

/// Find all `scf.for` loops in MLIR-style IR text.
///
/// A loop opens on the line containing `scf.for` and closes on the line where
/// the brace depth drops back to its opening depth. Loops are reported in
/// closing order.
#[must_use]
pub fn find_loop_bounds(content: &str) -> Vec<LoopBounds> {
    let mut bounds = Vec::new();
    // (opening line, brace depth before the loop opened)
    let mut open_loops: Vec<(usize, i64)> = Vec::new();
    let mut depth: i64 = 0;

    for (idx, line) in content.lines().enumerate() {
        if line.contains("scf.for") {
            open_loops.push((idx, depth));
        }
        for char in line.chars() {
            match char {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    while let Some(&(start, opening_depth)) = open_loops.last() {
                        if depth > opening_depth {
                            break;
                        }
                        open_loops.pop();
                        bounds.push(LoopBounds { start, end: idx });
                    }
                }
                _ => {}
            }
        }
    }
    bounds
}

/// Find the inner `scf.for` loops: loops with no other loop nested inside.
/// These are the candidates for software pipelining.
#[must_use]
pub fn find_inner_loop_bounds(content: &str) -> Vec<LoopBounds> {
    let all = find_loop_bounds(content);
    all.iter()
        .copied()
        .filter(|outer| {
            !all.iter()
                .any(|inner| outer.start < inner.start && inner.end < outer.end)
        })
        .collect()
}

/// Memory operations counted in AMD TTGIR.
pub const TTGIR_MEMORY_OPS: &[&str] = &[
    "tt.load",
    "tt.store",
    "amdgpu.buffer_load",
    "amdgpu.buffer_store",
];

/// Memory operations counted in AMD GCN assembly.
pub const GCN_MEMORY_OPS: &[&str] = &[
    "global_load",
    "global_store",
    "buffer_load",
    "buffer_store",
];

/// Count the lines of `content` mentioning each operation, keyed
/// `<op>_count`. Every requested operation appears in the output, zero when
/// absent.
#[must_use]
pub fn count_memory_ops(content: &str, ops: &[&str]) -> IndexMap<String, u64> {
    let mut counts = vec![0u64; ops.len()];
    for line in content.lines() {
        for (op, count) in ops.iter().zip(counts.iter_mut()) {
            if line.contains(op) {
                *count += 1;
            }
        }
    }
    ops.iter()
        .zip(counts)
        .map(|(op, count)| (format!("{op}_count"), count))
        .collect()
}

// Software-pipelining candidate ops in TTGIR. The trailing space keeps
// `warp_group_dot` from also matching `warp_group_dot_wait`.
const PIPELINE_OPS: &[&str] = &[
    "tt.load ",
    "tt.dot ",
    "async_copy_global_to_local ",
    "warp_group_dot ",
];

/// Pipelining candidates around one inner loop, each resolved to its original
/// kernel source line where the source map allows, in program order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSchedule {
    pub loop_bounds: LoopBounds,
    pub prologue: Vec<String>,
    pub loop_body: Vec<String>,
    pub epilogue: Vec<String>,
}

/// Build one [`LoopSchedule`] per inner `scf.for` loop of a TTGIR artifact.
///
/// Candidate operations hoisted before the loop land in the prologue, drained
/// after it in the epilogue. Each is rendered as its original kernel source
/// line when the artifact's location annotations resolve one, otherwise as
/// the trimmed IR line itself.
#[must_use]
pub fn loop_schedules(ttgir: &str, python_source: Option<&PythonSource>) -> Vec<LoopSchedule> {
    let inner_loops = find_inner_loop_bounds(ttgir);
    if inner_loops.is_empty() {
        return Vec::new();
    }

    let source_map = sourcemap::extract(Dialect::Ttgir, ttgir);
    let python_lines: Vec<&str> = python_source
        .and_then(|source| source.code.as_deref())
        .map(|code| code.lines().collect())
        .unwrap_or_default();
    let start_line = python_source
        .and_then(|source| source.start_line)
        .unwrap_or(1);

    let mut schedules = Vec::with_capacity(inner_loops.len());
    for bounds in inner_loops {
        let mut schedule = LoopSchedule {
            loop_bounds: bounds,
            prologue: Vec::new(),
            loop_body: Vec::new(),
            epilogue: Vec::new(),
        };
        for (idx, line) in ttgir.lines().enumerate() {
            if !PIPELINE_OPS.iter().any(|op| line.contains(op)) {
                continue;
            }
            let mut rendered = line.trim().to_string();
            if let Some(mapping) = source_map.get(&((idx + 1) as u32)) {
                // mapping lines are absolute, the captured source may not
                // start at line 1 of its file
                let offset = mapping.line.checked_sub(start_line).map(|o| o as usize);
                if let Some(source_line) = offset.and_then(|o| python_lines.get(o)) {
                    rendered = source_line.trim().to_string();
                }
            }
            if idx < bounds.start {
                schedule.prologue.push(rendered);
            } else if idx <= bounds.end {
                schedule.loop_body.push(rendered);
            } else {
                schedule.epilogue.push(rendered);
            }
        }
        schedules.push(schedule);
    }
    schedules
}

fn artifact_with_extension<'a>(
    file_content: &'a IndexMap<String, String>,
    extension: &str,
) -> Option<&'a String> {
    file_content
        .iter()
        .find(|(name, _)| name.ends_with(extension))
        .map(|(_, content)| content)
}

/// Analyze the IR artifacts of one compilation payload.
///
/// Produces `io_counts` when both the TTGIR and GCN artifacts of an AMD
/// compilation are present, and `loop_schedules` when the TTGIR contains
/// `scf.for` loops. Payloads without recognized IR yield an empty map.
#[must_use]
pub fn analyze(payload: &Payload) -> IndexMap<String, serde_json::Value> {
    let mut out = IndexMap::new();

    let ttgir = artifact_with_extension(&payload.file_content, ".ttgir");
    let amdgcn = artifact_with_extension(&payload.file_content, ".amdgcn");

    if let (Some(ttgir), Some(amdgcn)) = (ttgir, amdgcn) {
        out.insert(
            "io_counts".to_string(),
            serde_json::json!({
                "amd_ttgir_bufferops_count": count_memory_ops(ttgir, TTGIR_MEMORY_OPS),
                "amd_gcn_bufferops_count": count_memory_ops(amdgcn, GCN_MEMORY_OPS),
            }),
        );
    }

    if let Some(ttgir) = ttgir {
        let schedules = loop_schedules(ttgir, payload.python_source.as_ref());
        if !schedules.is_empty() {
            log::debug!("found {} inner loop schedules", schedules.len());
            out.insert(
                "loop_schedules".to_string(),
                serde_json::json!(schedules),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        analyze, count_memory_ops, find_inner_loop_bounds, find_loop_bounds, loop_schedules,
        LoopBounds, GCN_MEMORY_OPS, TTGIR_MEMORY_OPS,
    };
    use crate::trace::{Payload, PythonSource};
    use similar_asserts as diff;

    const NESTED_LOOPS: &str = "tt.func public @k() {\n\
  %0 = scf.for %i = %c0 to %c8 step %c1 {\n\
    %1 = scf.for %j = %c0 to %c4 step %c1 {\n\
      %2 = arith.addi %j, %j : i32\n\
    }\n\
  }\n\
  scf.for %m = %c0 to %c2 step %c1 {\n\
    tt.store %p, %v\n\
  }\n\
}\n";

    #[test]
    fn loop_bounds_track_brace_depth() {
        let bounds = find_loop_bounds(NESTED_LOOPS);
        diff::assert_eq!(
            have: bounds,
            want: vec![
                LoopBounds { start: 2, end: 4 },
                LoopBounds { start: 1, end: 5 },
                LoopBounds { start: 6, end: 8 },
            ]
        );
    }

    #[test]
    fn inner_loops_exclude_nests() {
        let bounds = find_inner_loop_bounds(NESTED_LOOPS);
        diff::assert_eq!(
            have: bounds,
            want: vec![
                LoopBounds { start: 2, end: 4 },
                LoopBounds { start: 6, end: 8 },
            ]
        );
    }

    #[test]
    fn no_loops_yield_nothing() {
        assert!(find_loop_bounds("tt.func public @k() {\n}\n").is_empty());
        assert!(find_inner_loop_bounds("").is_empty());
    }

    #[test]
    fn memory_op_counts_include_zeroes() {
        let ttgir = "%1 = tt.load %0\n\
%2 = amdgpu.buffer_load %1\n\
tt.store %p, %2\n\
%3 = tt.load %q\n";
        let counts = count_memory_ops(ttgir, TTGIR_MEMORY_OPS);
        diff::assert_eq!(have: counts["tt.load_count"], want: 2);
        diff::assert_eq!(have: counts["tt.store_count"], want: 1);
        diff::assert_eq!(have: counts["amdgpu.buffer_load_count"], want: 1);
        diff::assert_eq!(have: counts["amdgpu.buffer_store_count"], want: 0);
    }

    #[test]
    fn gcn_counts_are_per_line() {
        let gcn = "global_load_dwordx4 v[0:3], v[4:5], off\n\
buffer_store_dword v0, v1, s[0:3], 0 offen\n";
        let counts = count_memory_ops(gcn, GCN_MEMORY_OPS);
        diff::assert_eq!(have: counts["global_load_count"], want: 1);
        diff::assert_eq!(have: counts["buffer_store_count"], want: 1);
        diff::assert_eq!(have: counts["global_store_count"], want: 0);
    }

    const PIPELINED_TTGIR: &str = r#"#loc1 = loc("/k.py":12:8)
#loc2 = loc("/k.py":14:20)
tt.func public @k() {
  %0 = ttg.async_copy_global_to_local %a, %buf loc(#loc1)
  scf.for %i = %c0 to %c8 step %c1 {
    %1 = ttng.warp_group_dot %x, %y, %acc loc(#loc2)
  }
  %2 = tt.load %tail
  tt.return
}
"#;

    #[test]
    fn schedule_splits_prologue_body_epilogue() {
        let source = PythonSource {
            file_path: Some("/k.py".to_string()),
            code: Some(
                "@triton.jit\n\
def k(a_ptr, b_ptr):\n\
    a = tl.load(a_ptr)\n\
    acc = tl.zeros((16,), dtype=tl.float32)\n\
    acc += tl.dot(a, b)\n"
                    .to_string(),
            ),
            start_line: Some(10),
        };
        let schedules = loop_schedules(PIPELINED_TTGIR, Some(&source));
        diff::assert_eq!(have: schedules.len(), want: 1);
        let schedule = &schedules[0];
        diff::assert_eq!(have: schedule.loop_bounds, want: LoopBounds { start: 4, end: 6 });
        // annotated ops resolve to the captured kernel source
        diff::assert_eq!(have: &schedule.prologue, want: &vec!["a = tl.load(a_ptr)".to_string()]);
        diff::assert_eq!(have: &schedule.loop_body, want: &vec!["acc += tl.dot(a, b)".to_string()]);
        // unannotated ops fall back to the IR line itself
        diff::assert_eq!(have: &schedule.epilogue, want: &vec!["%2 = tt.load %tail".to_string()]);
    }

    #[test]
    fn schedule_without_source_uses_ir_lines() {
        let schedules = loop_schedules(PIPELINED_TTGIR, None);
        diff::assert_eq!(
            have: &schedules[0].loop_body,
            want: &vec!["%1 = ttng.warp_group_dot %x, %y, %acc loc(#loc2)".to_string()]
        );
    }

    #[test]
    fn analyze_gates_io_counts_on_amd_artifacts() {
        let mut payload = Payload::default();
        payload.file_content.insert(
            "k.ttgir".to_string(),
            "scf.for %i = %c0 to %c8 step %c1 {\n  %0 = tt.load %p\n}\n".to_string(),
        );
        let analysis = analyze(&payload);
        assert!(!analysis.contains_key("io_counts"));
        diff::assert_eq!(
            have: analysis["loop_schedules"][0]["loop_body"][0].as_str().unwrap(),
            want: "%0 = tt.load %p"
        );

        payload.file_content.insert(
            "k.amdgcn".to_string(),
            "global_load_dword v0, v[0:1], off\n".to_string(),
        );
        let analysis = analyze(&payload);
        let io_counts = &analysis["io_counts"];
        diff::assert_eq!(
            have: io_counts["amd_ttgir_bufferops_count"]["tt.load_count"].as_u64().unwrap(),
            want: 1
        );
        diff::assert_eq!(
            have: io_counts["amd_gcn_bufferops_count"]["global_load_count"].as_u64().unwrap(),
            want: 1
        );
    }

    #[test]
    fn analyze_without_ir_is_empty() {
        let mut payload = Payload::default();
        payload
            .file_content
            .insert("k.json".to_string(), "{}".to_string());
        assert!(analyze(&payload).is_empty());
    }
}
