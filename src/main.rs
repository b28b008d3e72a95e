use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use jqs::{cancel, node_report, open_paths, poll_interval, production_scheduler};
use jqs::{queue_view, read_job, submit};

/// Single-node batch job scheduler.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Override the base directory holding queue/running/finished state.
    #[arg(long, global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a script for scheduling.
    Submit { script: PathBuf },

    /// List pending, running, and recently finished jobs.
    Q,

    /// Print a job's metadata document.
    Info { id: String },

    /// Cancel a pending or running job.
    Cancel { id: String },

    /// Print resource limits and current usage.
    Nodes,

    /// Run the scheduling loop.
    Scheduler {
        /// Seconds between cycles; overrides config.json's poll_interval_sec.
        #[arg(long)]
        interval: Option<u64>,

        /// Run exactly one cycle and exit.
        #[arg(long)]
        once: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    match try_main(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn try_main(cli: Cli) -> jqs::Result<()> {
    let paths = open_paths(cli.dir).map_err(|e| jqs::JqsError::io(".", e))?;

    match cli.command {
        Commands::Submit { script } => {
            let id = submit(&paths, &script)?;
            println!("Job submitted: {id}");
            Ok(())
        }
        Commands::Q => {
            print_queue(&paths)?;
            Ok(())
        }
        Commands::Info { id } => {
            let job = read_job(&paths, &id)?
                .ok_or_else(|| jqs::JqsError::NotFound(id.clone()))?;
            let text = serde_json::to_string_pretty(&job)
                .map_err(|e| jqs::JqsError::io(&id, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            println!("{text}");
            Ok(())
        }
        Commands::Cancel { id } => {
            cancel(paths, &id)?;
            println!("Job {id} cancelled");
            Ok(())
        }
        Commands::Nodes => {
            let (limits, usage) = node_report(&paths)?;
            println!("Node Resources:");
            println!("  Total Cores: {}", limits.cores_total);
            println!("  Used Cores:  {}", usage.cores_used);
            println!("  Available:   {}", limits.cores_total - usage.cores_used);
            println!();
            println!("  Total Memory: {} MB", limits.mem_mb_total);
            println!("  Used Memory:  {} MB", usage.mem_mb_used);
            println!("  Available:    {} MB", limits.mem_mb_total - usage.mem_mb_used);
            Ok(())
        }
        Commands::Scheduler { interval, once } => run_scheduler(paths, interval, once),
    }
}

fn print_queue(paths: &jqs::PathStore) -> jqs::Result<()> {
    let (active, finished) = queue_view(paths);
    println!(
        "{:<20} {:<20} {:<15} {:<12} {:<20}",
        "JOBID", "NAME", "USER", "STATE", "SUBMIT_TIME"
    );
    println!("{}", "-".repeat(85));
    for job in active.iter().chain(finished.iter()) {
        let submit_time: String = job.submit_time.chars().take(19).collect();
        println!(
            "{:<20} {:<20} {:<15} {:<12} {:<20}",
            job.job_id, job.name, job.user, job.state, submit_time
        );
    }
    Ok(())
}

fn run_scheduler(paths: jqs::PathStore, interval: Option<u64>, once: bool) -> jqs::Result<()> {
    let scheduler = production_scheduler(paths.clone());

    if once {
        let report = scheduler.cycle()?;
        println!("Scheduler cycle completed:");
        println!("  Completed jobs: {}", report.completed);
        println!("  Scheduled jobs: {}", report.scheduled);
        println!("  Cleaned jobs: {}", report.cleaned);
        return Ok(());
    }

    let interval = interval
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| poll_interval(&paths));

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| jqs::JqsError::io(".", std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    scheduler.run(interval, shutdown)
}
