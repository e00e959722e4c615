use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use tracejit::config::JitConfig;
use tracejit::jit::{FrameExit, Optimization};
use tracejit::sim::{self, RunReport};
use tracejit::tracefile::TraceFile;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "tracejit")]
#[command(about = "Replay recorded traces through the JIT compilation pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the loop of a trace file and replay its guard failures
    Run {
        /// The JSON trace file
        file: PathBuf,

        /// Load settings from a TOML config file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Compile loops without peeling
        #[arg(long)]
        no_unroll: bool,

        /// Guard failures before a bridge is traced
        #[arg(long)]
        trace_eagerness: Option<u32>,

        /// Colon-separated list of optimizations, or "all"
        #[arg(long)]
        enable_opts: Option<String>,

        /// Print every compiled loop and bridge
        #[arg(long)]
        dump: bool,

        /// Print compilation statistics (human or json format)
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        stats: Option<StatsFormatArg>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,
    },
    /// Print the default configuration as TOML
    Config,
}

fn init_logging(trace_jit: bool) {
    let filter = if trace_jit {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_config(
    path: Option<&PathBuf>,
    no_unroll: bool,
    trace_eagerness: Option<u32>,
    enable_opts: Option<String>,
    trace_jit: bool,
) -> Result<JitConfig, String> {
    let mut config = match path {
        Some(path) => JitConfig::load(path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => JitConfig::default(),
    };
    if let Some(opts) = enable_opts {
        config.enable_opts = opts;
    }
    if no_unroll {
        let opts = config.optimizer_config().map_err(|e| e.to_string())?;
        config.enable_opts = opts.without(Optimization::Unroll).to_string();
    }
    if let Some(eagerness) = trace_eagerness {
        config.trace_eagerness = eagerness;
    }
    config.trace_jit |= trace_jit;
    // catch bad names before anything runs
    config.optimizer_config().map_err(|e| e.to_string())?;
    Ok(config)
}

fn print_report(report: &RunReport, dump: bool, stats: Option<StatsFormatArg>) -> Result<(), String> {
    if dump {
        print!("{}", report.dump);
    }
    for exit in &report.exits {
        match exit {
            FrameExit::DoneWithThisFrame(value) => println!("done: {}", value),
            FrameExit::ExitFrameWithException(exc) => println!("exception: {:#x}", exc.0),
            FrameExit::ContinueRunningNormally(values) => {
                let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                println!("continue: [{}]", values.join(", "));
            }
        }
    }
    match stats {
        Some(StatsFormatArg::Human) => eprintln!("{}", report.stats),
        Some(StatsFormatArg::Json) => {
            let json = serde_json::to_string_pretty(&report.stats).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        None => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            no_unroll,
            trace_eagerness,
            enable_opts,
            dump,
            stats,
            trace_jit,
        } => {
            let config = match build_config(config.as_ref(), no_unroll, trace_eagerness, enable_opts, trace_jit) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            init_logging(config.trace_jit);

            let trace = match TraceFile::load(&file) {
                Ok(trace) => trace,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let result = sim::run(&trace, &config)
                .map_err(|e| e.to_string())
                .and_then(|report| print_report(&report, dump, stats));
            if let Err(e) = result {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Config => match JitConfig::default().to_toml() {
            Ok(text) => print!("{}", text),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}
