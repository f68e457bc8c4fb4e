use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use pth_cpu::trust::TrustError;
use pth_cpu::{convert_with_progress, ErrorKind, LoadOptions, Preset, Stage, TrustConfig, TrustedTypes};

#[derive(Parser)]
#[command(name = "pth-cpu")]
#[command(version, about = "Convert a torch checkpoint so every tensor is stored on the CPU", long_about = None)]
struct Args {
    /// Checkpoint to convert
    #[arg(long, value_parser = existing_file)]
    model_path: PathBuf,

    /// Where to write the CPU-only checkpoint (overwritten if present)
    #[arg(long)]
    output_path: PathBuf,

    /// Extra trusted global, as module.name or module.*
    #[arg(long = "allow-global", value_name = "MODULE.NAME")]
    allow_global: Vec<String>,

    /// Trusted-type preset to enable (mace is on unless --strict-globals)
    #[arg(long, value_enum)]
    preset: Vec<Preset>,

    /// Start from torch's weights-only globals without the mace preset
    #[arg(long)]
    strict_globals: bool,

    /// JSON file with extra trusted types
    #[arg(long, value_name = "FILE")]
    allow_list: Option<PathBuf>,

    /// Reconstruct any global the checkpoint references
    #[arg(long)]
    trust_all_globals: bool,

    /// Print a JSON conversion report instead of progress messages
    #[arg(long)]
    json: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn existing_file(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("{s} does not exist or is not a file"))
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?)
        .init();
    Ok(())
}

fn trusted_types(args: &Args) -> Result<TrustedTypes, TrustError> {
    let mut trusted = match &args.allow_list {
        Some(path) => TrustedTypes::from_config(&TrustConfig::from_file(path)?)?,
        None => TrustedTypes::torch_defaults(),
    };
    if !args.strict_globals {
        trusted.add_preset(Preset::Mace);
    }
    for preset in &args.preset {
        trusted.add_preset(*preset);
    }
    for entry in &args.allow_global {
        trusted.allow(entry)?;
    }
    if args.trust_all_globals {
        trusted.set_trust_all(true);
    }
    Ok(trusted)
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let trusted = match trusted_types(&args) {
        Ok(trusted) => trusted,
        Err(e) => {
            println!("An error occurred: {e}");
            return ExitCode::from(ErrorKind::Validation.exit_code());
        }
    };
    let options = LoadOptions { trusted, ..LoadOptions::default() };

    let echo = !args.json;
    let result = convert_with_progress(&args.model_path, &args.output_path, &options, |stage| {
        if !echo {
            return;
        }
        match stage {
            Stage::Loading(path) => println!("Loading the model from {} onto CPU...", path.display()),
            Stage::Saving(path) => println!("Saving the CPU-only model to {}...", path.display()),
        }
    });

    match result {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        println!("An error occurred: {e}");
                        return ExitCode::from(ErrorKind::Serialization.exit_code());
                    }
                }
            } else {
                println!("Model successfully saved as CPU-only!");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::debug!(kind = %e.kind(), "conversion failed");
            println!("An error occurred: {e}");
            ExitCode::from(e.kind().exit_code())
        }
    }
}
