//! Offload CLI - run workloads on worker threads, worker processes and process groups.

mod report;
mod run;
mod workload;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use workload::{Input, Workload};

#[derive(Parser)]
#[command(name = "offload")]
#[command(about = "Run built-in workloads on deferred-execution backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print outcomes as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Input value handed to every workload
    #[arg(long, default_value = "7")]
    value: u64,

    /// Milliseconds each workload sleeps before doing its work
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Stop waiting after this many milliseconds (processes are killed)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl RunArgs {
    fn input(&self) -> Input {
        Input {
            value: self.value,
            delay_ms: self.delay_ms,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload on a worker thread
    Thread {
        #[arg(value_enum)]
        workload: Workload,

        #[command(flatten)]
        args: RunArgs,
    },

    /// Run a workload in an isolated worker process
    Process {
        #[arg(value_enum)]
        workload: Workload,

        #[command(flatten)]
        args: RunArgs,
    },

    /// Run several workloads as a process group with a synchronized start
    Group {
        /// Workloads in member order
        #[arg(value_enum, required = true)]
        workloads: Vec<Workload>,

        #[command(flatten)]
        args: RunArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format offload-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(offload_err) = err.downcast_ref::<offload_core::Error>() {
            anyhow::anyhow!("{}", offload_err.with_hint())
        } else {
            err
        }
    };

    let report = match &cli.command {
        Commands::Thread { workload, args } => {
            run::thread(*workload, args.input(), args.timeout()).map_err(format_error)?
        }
        Commands::Process { workload, args } => {
            run::process(*workload, args.input(), args.timeout()).map_err(format_error)?
        }
        Commands::Group { workloads, args } => {
            run::group(workloads, args.input(), args.timeout()).map_err(format_error)?
        }
    };

    report.print(cli.json)?;

    let unsuccessful = report.unsuccessful();
    if unsuccessful > 0 {
        anyhow::bail!(
            "{} of {} workloads did not succeed",
            unsuccessful,
            report.members.len()
        );
    }

    Ok(())
}
