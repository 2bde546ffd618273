//! Reproducer context assembly.
//!
//! Bundles everything the external reproducer-generation collaborator needs
//! to rebuild one kernel launch: kernel identity, launch grid, argument
//! descriptors, and the compilation settings subset that affects codegen.
//! Template rendering and kernel execution happen outside this crate.

use crate::args::ArgumentDescriptor;
use crate::correlate::{self, KernelInfo};
use crate::trace::TraceEvent;
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Correlate(#[from] correlate::Error),
    #[error("could not create output directory {path:?}")]
    CreateDirectories {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write reproducer context {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not encode reproducer context")]
    Encode {
        #[from]
        source: serde_json::Error,
    },
}

/// Compilation settings subset carried into the reproducer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompileBlock {
    pub num_warps: Option<u32>,
    pub num_stages: Option<u32>,
    pub arch: Option<String>,
    pub backend: Option<String>,
    pub triton_version: Option<String>,
    pub hash: Option<String>,
}

/// Everything needed to reproduce one kernel launch.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub kernel_info: KernelInfo,
    pub grid: Vec<u64>,
    pub extracted_args: IndexMap<String, ArgumentDescriptor>,
    pub compile_block: CompileBlock,
}

/// Correlate the launch at `index` and assemble its reproducer context.
pub fn build_context_bundle(
    events: &[TraceEvent],
    index: usize,
) -> Result<ContextBundle, Error> {
    let (launch, compilation) = correlate::correlate(events, index)?;
    let kernel_info = correlate::extract_kernel_info(compilation)?;

    let meta = launch.compilation_metadata.as_ref();
    let compile_block = match meta {
        Some(meta) => CompileBlock {
            num_warps: meta.num_warps,
            num_stages: meta.num_stages,
            arch: meta.arch.clone(),
            backend: meta.backend_name.clone().or_else(|| meta.backend.clone()),
            triton_version: meta.triton_version.clone(),
            hash: meta.hash.clone(),
        },
        None => CompileBlock::default(),
    };

    log::debug!(
        "built context bundle for kernel {}",
        kernel_info.function_name
    );
    Ok(ContextBundle {
        kernel_info,
        grid: launch.grid.clone().unwrap_or_default(),
        extracted_args: launch.extracted_args.clone(),
        compile_block,
    })
}

/// Output locations for one reproducer run: the generated script and its
/// context JSON, under `<out_dir>/<kernel_name>/`, timestamped so repeated
/// runs never clobber each other.
pub fn determine_output_paths(
    out_dir: impl AsRef<Path>,
    kernel_name: &str,
) -> Result<(PathBuf, PathBuf), Error> {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let output_directory = out_dir.as_ref().join(kernel_name);
    std::fs::create_dir_all(&output_directory).map_err(|source| Error::CreateDirectories {
        path: output_directory.clone(),
        source,
    })?;

    let script_path = output_directory.join(format!("repro_{timestamp}.py"));
    let context_path = output_directory.join(format!("repro_context_{timestamp}.json"));
    Ok((script_path, context_path))
}

/// Serialize a context bundle to its JSON file for the external template
/// renderer.
pub fn write_context(bundle: &ContextBundle, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(bundle)?;
    std::fs::write(path, json).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}
