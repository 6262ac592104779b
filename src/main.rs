use clap::{Args, Parser, Subcommand};
use emt_fleet::config::{Config, Overrides};
use emt_fleet::report::format_energy;
use emt_fleet::utils::logger::{flush_logger, setup_logger};
use emt_fleet::{
    CommandRunner, ConsoleSink, Controller, EnergyUnit, LogSink, MeasurementMethod, MeasurementStrategy,
    MonitoringError, RunOptions, SysinfoSource, SystemClock,
};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(name = "emt-fleet", version, about = "Per-process energy consumption monitor")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track every running process until interrupted (Ctrl-C)
    Monitor(MonitorArgs),
    /// Run a single command and report the energy it consumed
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Measurement method: hardware (RAPL, falls back to simulated) or simulated
    #[clap(long)]
    method: Option<MeasurementMethod>,

    /// Simulated consumption rate, units per second
    #[clap(long)]
    rate: Option<f64>,
}

#[derive(Args, Debug)]
struct MonitorArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// Seconds between polls
    #[clap(long, short)]
    interval: Option<f64>,

    /// Directory for the final CSV report
    #[clap(long)]
    output_dir: Option<PathBuf>,

    /// Stop after this many polling cycles
    #[clap(long)]
    cycles: Option<u64>,

    /// Only print the finished-process history in the final summary
    #[clap(long)]
    no_history: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// Time limit in seconds (defaults to EMT_MAX_EXECUTION_TIME)
    #[clap(long, short)]
    timeout: Option<f64>,

    /// Run the command through the shell
    #[clap(long)]
    shell: bool,

    /// Label for the measurement
    #[clap(long, default_value = "ProcessRunner")]
    label: String,

    /// Command and arguments
    #[clap(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

impl Command {
    fn overrides(&self) -> Overrides {
        match self {
            Command::Monitor(args) => Overrides {
                polling_interval: args.interval,
                measurement_method: args.common.method,
                consumption_rate: args.common.rate,
                output_dir: args.output_dir.clone(),
                ..Default::default()
            },
            Command::Run(args) => Overrides {
                measurement_method: args.common.method,
                consumption_rate: args.common.rate,
                max_execution_time: args.timeout,
                ..Default::default()
            },
        }
    }
}

async fn monitor(config: Config, args: MonitorArgs, logger: LogSink) -> Result<ExitCode, MonitoringError> {
    let mut controller = Controller::new(SysinfoSource::new(), &config, Arc::new(SystemClock), logger.clone())?;
    if let Some(cycles) = args.cycles {
        controller = controller.with_max_cycles(cycles);
    }

    let handle = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping monitoring");
            handle.request_stop();
        }
    });

    println!("Process monitoring started. Press Ctrl-C to stop and see the total consumption.");
    let mut sink = ConsoleSink {
        show_history: !args.no_history,
    };
    let report = controller.run(&mut sink).await?;
    println!(
        "Monitoring complete. Total consumption: {}",
        format_energy(Some(report.total), report.unit)
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(config: Config, args: RunArgs, logger: LogSink) -> Result<ExitCode, MonitoringError> {
    let strategy = MeasurementStrategy::resolve(config.measurement_method, config.command_rate(), &logger)?;
    let runner = CommandRunner::new(strategy, EnergyUnit::Joules, Arc::new(SystemClock), logger.child("runner"))
        .with_cpu_source(Arc::new(SysinfoSource::new()));
    let options = RunOptions {
        shell: args.shell,
        label: args.label,
        timeout: Some(config.max_execution_time.0).filter(|limit| !limit.is_zero()),
        capture_output: true,
    };

    let outcome = runner.run(&args.command, &options).await?;
    println!("Exit code: {}", outcome.exit_code.map_or("none".to_string(), |c| c.to_string()));
    if outcome.timed_out {
        println!(
            "Timed out after {:.1} seconds",
            options.timeout.unwrap_or(Duration::ZERO).as_secs_f64()
        );
    }
    println!("Output: {}", outcome.stdout.trim_end());
    println!("Errors: {}", outcome.stderr.trim_end());
    println!(
        "Energy consumed: {}",
        format_energy(outcome.energy_consumed, outcome.unit)
    );
    if let Some(cpu_time) = outcome.cpu_time {
        println!(
            "CPU time: {:.3} seconds, estimated {}",
            cpu_time.as_secs_f64(),
            format_energy(outcome.cpu_energy, outcome.unit)
        );
    }

    Ok(match (outcome.timed_out, outcome.exit_code) {
        (true, _) => ExitCode::from(124),
        (false, Some(code)) => ExitCode::from(code.clamp(0, 255) as u8),
        (false, None) => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load().and_then(|config| config.apply(cli.command.overrides())) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(2);
        }
    };

    setup_logger(config.log_level);
    let logger = LogSink::new("emt");
    info!("Application started");

    let result = match cli.command {
        Command::Monitor(args) => monitor(config, args, logger.child("monitor")).await,
        Command::Run(args) => run(config, args, logger.child("run")).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            logger.error(format!("{}", e));
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    };
    flush_logger();
    code
}
