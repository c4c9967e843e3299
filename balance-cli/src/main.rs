mod reports;

use anyhow::{Context, Result};
use balance_engine::{
    BalanceError, BalanceReport, BalanceRequest, Mode, RunOptions, run_request_with,
};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Coloured tables for a terminal
    Console,
    /// Pretty-printed structured report
    Json,
    /// Headings and pipe tables
    Markdown,
}

#[derive(Debug, Parser)]
#[command(name = "balance-cli", version)]
#[command(about = "Game-balance calculators: pacing, economy flow, enhancement cost, clear rates")]
struct Args {
    /// Calculator mode (ttk_ehp, economy_flow, enhancement_cost, clear_probability)
    #[arg(long, value_parser = parse_mode)]
    mode: Option<Mode>,

    /// Request document; the mode's built-in sample runs when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Console)]
    report: ReportFormat,

    /// Optional path to write the report output instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Override the seed of stochastic calculators
    #[arg(long)]
    seed: Option<u64>,

    /// Override the Monte Carlo batch size
    #[arg(long)]
    trials: Option<usize>,

    /// List all available modes and exit
    #[arg(long)]
    list_modes: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_mode(raw: &str) -> std::result::Result<Mode, String> {
    raw.parse::<Mode>().map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

/// 2 for configuration/domain errors, 3 for convergence, 1 for anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<BalanceError>() {
        Some(balance) if balance.is_convergence() => 3,
        Some(_) => 2,
        None => 1,
    }
}

fn run(args: &Args) -> Result<()> {
    if args.list_modes {
        return list_modes(args);
    }

    let request = load_request(args)?;
    let options = RunOptions {
        seed: args.seed,
        trials: args.trials,
    };
    log::debug!("running {} with {options:?}", request.mode);

    match run_request_with(&request, options) {
        Ok(report) => write_report(args, &report),
        Err(BalanceError::Convergence {
            context,
            limit,
            partial,
        }) => {
            if let Some(partial) = &partial {
                log::warn!("writing truncated partial report");
                write_report(args, &BalanceReport::EnhancementCost((**partial).clone()))?;
            }
            Err(BalanceError::Convergence {
                context,
                limit,
                partial,
            }
            .into())
        }
        Err(err) => Err(err.into()),
    }
}

fn load_request(args: &Args) -> Result<BalanceRequest> {
    let Some(path) = &args.input else {
        let mode = args.mode.ok_or_else(|| {
            BalanceError::Config {
                field: "mode".to_string(),
                reason: "--mode is required when no --input document is given".to_string(),
            }
        })?;
        log::info!("no input document; using the built-in {mode} sample");
        return Ok(BalanceRequest::sample(mode));
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let request = BalanceRequest::from_json(&text)?;
    if let Some(mode) = args.mode
        && mode != request.mode
    {
        return Err(BalanceError::Config {
            field: "mode".to_string(),
            reason: format!("--mode {mode} conflicts with document mode {}", request.mode),
        }
        .into());
    }
    Ok(request)
}

fn list_modes(args: &Args) -> Result<()> {
    let mut output_target = OutputTarget::new(args.output.clone())?;
    writeln!(output_target.writer(), "Available modes:")?;
    for mode in Mode::ALL {
        writeln!(
            output_target.writer(),
            "  {:18} - {}",
            mode.as_str(),
            mode.description()
        )?;
    }
    output_target.flush_inner()?;
    Ok(())
}

fn write_report(args: &Args, report: &BalanceReport) -> Result<()> {
    let mut output_target = OutputTarget::new(args.output.clone())?;
    match args.report {
        ReportFormat::Json => reports::generate_json_report(&mut output_target, report)?,
        ReportFormat::Markdown => reports::generate_markdown_report(&mut output_target, report)?,
        ReportFormat::Console => reports::generate_console_report(&mut output_target, report)?,
    }
    output_target
        .flush_inner()
        .context("failed to flush report output")
}

enum OutputTarget {
    Stdout(BufWriter<std::io::Stdout>),
    File(BufWriter<File>),
}

impl OutputTarget {
    fn new(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Self::File(BufWriter::new(file)))
        } else {
            Ok(Self::Stdout(BufWriter::new(stdout())))
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stdout(w) => w,
            Self::File(w) => w,
        }
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout(w) => w.flush(),
            Self::File(w) => w.flush(),
        }
    }
}

impl Write for OutputTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            mode: None,
            input: None,
            report: ReportFormat::Console,
            output: None,
            seed: None,
            trials: None,
            list_modes: false,
            verbose: false,
        }
    }

    #[test]
    fn missing_mode_without_input_is_config_error() {
        let err = load_request(&base_args()).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn sample_request_uses_mode_flag() {
        let args = Args {
            mode: Some(Mode::ClearProbability),
            ..base_args()
        };
        let request = load_request(&args).unwrap();
        assert_eq!(request, BalanceRequest::sample(Mode::ClearProbability));
    }

    #[test]
    fn unreadable_input_is_io_error() {
        let args = Args {
            input: Some(PathBuf::from("/nonexistent/balance-request.json")),
            ..base_args()
        };
        let err = load_request(&args).unwrap_err();
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn convergence_maps_to_warning_exit() {
        let err = anyhow::Error::from(BalanceError::Convergence {
            context: "test".to_string(),
            limit: 1,
            partial: None,
        });
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn parse_mode_rejects_unknown_names() {
        assert_eq!(parse_mode("economy_flow").unwrap(), Mode::EconomyFlow);
        assert!(parse_mode("economy-flow").is_err());
    }
}
