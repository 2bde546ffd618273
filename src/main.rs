use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use std::path::PathBuf;
use tritrace::args::{Capabilities, Synthesizer};
use tritrace::sourcemap::Dialect;
use tritrace::{repro, sourcemap, trace};

#[derive(Parser, Debug, Clone)]
enum Command {
    /// Build a reproducer context for one launch event of a trace
    Reproduce {
        /// Path to the NDJSON trace file
        trace: PathBuf,
        /// Index of the launch event to reproduce
        #[clap(long = "line-index")]
        line_index: usize,
        /// Output directory for reproducer files
        #[clap(long = "out-dir", default_value = "reproducer_output")]
        out_dir: PathBuf,
        /// Seed for deterministic argument synthesis
        #[clap(long)]
        seed: Option<u64>,
    },
    /// Extract source mappings from one generated artifact
    Sourcemap {
        /// Path to the artifact (.sass, .ptx, .ttir, .ttgir)
        input: PathBuf,
        /// Override the dialect detected from the file extension
        #[clap(long)]
        dialect: Option<String>,
    },
    /// Re-emit a trace with source mappings and IR analysis attached to
    /// compilation events
    Augment {
        /// Path to the NDJSON trace file
        trace: PathBuf,
    },
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Options {
    #[clap(subcommand)]
    command: Command,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    match options.command {
        Command::Reproduce {
            trace,
            line_index,
            out_dir,
            seed,
        } => reproduce(&trace, line_index, &out_dir, seed),
        Command::Sourcemap { input, dialect } => extract_sourcemap(&input, dialect.as_deref()),
        Command::Augment { trace } => augment(&trace),
    }
}

fn reproduce(
    trace_path: &std::path::Path,
    line_index: usize,
    out_dir: &std::path::Path,
    seed: Option<u64>,
) -> eyre::Result<()> {
    let events = trace::read_events(trace_path)?;
    log::debug!("loaded {} events", events.len());

    let bundle = repro::build_context_bundle(&events, line_index)?;
    let (_script_path, context_path) =
        repro::determine_output_paths(out_dir, &bundle.kernel_info.function_name)?;
    repro::write_context(&bundle, &context_path)?;

    // materialize every argument once so bad descriptors and corrupt blobs
    // fail here, not inside the generated script
    let capabilities = Capabilities::detect();
    let mut synthesizer = match seed {
        Some(seed) => Synthesizer::with_seed(capabilities, seed),
        None => Synthesizer::new(capabilities),
    };
    let values = synthesizer.materialize_all(&bundle.extracted_args)?;
    for (name, value) in &values {
        log::info!("materialized argument {name}: {value:?}");
    }

    println!(
        "wrote reproducer context for kernel {} to {}",
        bundle.kernel_info.function_name,
        context_path.display()
    );
    Ok(())
}

fn extract_sourcemap(input: &std::path::Path, dialect: Option<&str>) -> eyre::Result<()> {
    let dialect = match dialect {
        Some(name) => name
            .parse::<Dialect>()
            .map_err(|_| eyre::eyre!("unknown dialect {name:?}"))?,
        None => {
            let name = input
                .file_name()
                .and_then(std::ffi::OsStr::to_str)
                .unwrap_or_default();
            Dialect::from_artifact_name(name).ok_or_else(|| {
                eyre::eyre!("could not detect dialect from {}", input.display())
            })?
        }
    };
    let content = std::fs::read_to_string(input)
        .wrap_err_with(|| format!("could not read artifact {}", input.display()))?;
    let mappings = sourcemap::extract(dialect, &content);
    println!(
        "{}",
        serde_json::to_string_pretty(&sourcemap::to_json(dialect, &mappings))?
    );
    Ok(())
}

fn augment(trace_path: &std::path::Path) -> eyre::Result<()> {
    let mut events = trace::read_events(trace_path)?;
    for event in &mut events {
        trace::augment_source_mappings(event);
        trace::augment_ir_analysis(event);
    }
    use std::io::Write;
    let mut stdout = std::io::stdout().lock();
    for event in &events {
        serde_json::to_writer(&mut stdout, event)?;
        writeln!(&mut stdout)?;
    }
    Ok(())
}
