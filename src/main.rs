use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use pf_orchestrator::api::run_api;
use pf_orchestrator::config::{EngineConfig, OrchestratorConfig};
use pf_orchestrator::results::JobResults;
use pf_orchestrator::service::{JobService, JobSummary, DEFAULT_LIST_LIMIT};
use pf_orchestrator::shutdown::install_shutdown_handler;
use pf_orchestrator::worker::{run_worker, WorkerArgs};
use pf_orchestrator::{Datatype, JobRequest, JobState};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "pf-orchestrator")]
#[command(version)]
#[command(about = "Run and track PartitionFinder analyses as isolated local jobs")]
#[command(propagate_version = true)]
struct Args {
    /// Job store root (defaults to $PF_JOB_DIR, then ./.pf_jobs)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8000")]
        port: u16,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Submit a job, follow its log and print the results
    Run(RequestArgs),

    /// Submit a job and return immediately
    Submit(RequestArgs),

    /// Show the status of a job
    Status { job_id: String },

    /// List jobs, most recently updated first
    List {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },

    /// Show the results of a finished job
    Results { job_id: String },

    /// Stop a job (best effort)
    Stop { job_id: String },

    /// Delete a job that is not running
    Delete { job_id: String },

    /// Follow a job's log until it finishes
    Logs { job_id: String },

    /// Execute one job; started by the orchestrator, not by hand
    #[command(hide = true)]
    RunJob(WorkerArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct EngineArgs {
    /// Engine executable (default: python3 PartitionFinder.py)
    #[arg(long)]
    engine_program: Option<String>,

    /// Argument placed before the job's own arguments (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,
}

impl EngineArgs {
    fn to_config(&self) -> EngineConfig {
        match &self.engine_program {
            Some(program) => EngineConfig {
                program: program.clone(),
                args: self.engine_args.clone(),
            },
            None if self.engine_args.is_empty() => EngineConfig::default(),
            None => EngineConfig {
                args: self.engine_args.clone(),
                ..EngineConfig::default()
            },
        }
    }
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// Folder holding the .cfg file and alignment
    folder: PathBuf,

    /// DNA, protein or morphology
    #[arg(long, default_value = "DNA")]
    datatype: Datatype,

    /// Worker processes for the engine (1-256)
    #[arg(long, default_value_t = 1)]
    cpus: u32,

    /// Run in the input folder instead of an isolated copy
    #[arg(long)]
    no_copy: bool,

    /// Configuration override, KEY=VALUE (repeatable)
    #[arg(long = "override", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    #[command(flatten)]
    engine: EngineArgs,

    /// Arguments passed through to the engine
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl RequestArgs {
    fn to_request(&self) -> JobRequest {
        let mut request = JobRequest::new(&self.folder)
            .with_datatype(self.datatype)
            .with_cpus(self.cpus)
            .with_copy_input(!self.no_copy)
            .with_args(self.args.iter().cloned());
        for (key, value) in &self.overrides {
            request = request.with_override(key, value);
        }
        request
    }
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct ActionOutput<'a> {
    status: &'a str,
    job_id: &'a str,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(ansi: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();
}

fn build_service(store: Option<PathBuf>, engine: Option<EngineConfig>) -> pf_orchestrator::Result<JobService> {
    let mut config = OrchestratorConfig::from_env();
    if let Some(store) = store {
        config.store_root = store;
    }
    if let Some(engine) = engine {
        config = config.with_engine(engine);
    }
    JobService::new(config)
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

fn print_summary(job: &JobSummary) {
    println!("Job ID:     {}", job.id);
    println!("State:      {}", job.state);
    println!("Datatype:   {}", job.datatype);
    if let Some(cpus) = job.cpus {
        println!("CPUs:       {cpus}");
    }
    println!("Created:    {}", pf_orchestrator::job::timestamp(job.created_at));
    println!("Updated:    {}", pf_orchestrator::job::timestamp(job.updated_at));
    println!("Input:      {}", job.input_folder.display());
    println!("Working:    {}", job.working_folder.display());
    if let Some(code) = job.exit_code {
        println!("Exit Code:  {code}");
    }
    if let Some(error) = &job.error {
        println!("Error:      {error}");
    }
}

fn print_results(results: &JobResults) {
    println!("Job ID:   {}", results.id);
    println!("State:    {}", results.state);
    if let Some(path) = &results.analysis_path {
        println!("Analysis: {}", path.display());
    }
    match &results.best_scheme_txt {
        Some(text) => {
            println!();
            println!("{text}");
        }
        None => println!("No best scheme found."),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_serve(
    service: JobService,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let shutdown = install_shutdown_handler()?;
    tracing::info!(
        store_root = %service.store().root().display(),
        engine = %service.config().engine.program,
        "Starting pf-orchestrator"
    );
    run_api(addr, service, shutdown).await?;
    Ok(())
}

async fn handle_run(
    service: &JobService,
    request: JobRequest,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id = match service.submit(&request).await {
        Ok(id) => id,
        Err(e) => fail(e),
    };
    eprintln!("Submitted job {job_id}");

    let mut log = service.subscribe_log(&job_id)?;
    let follow = tokio::spawn(async move {
        while let Some(chunk) = log.next().await {
            eprint!("{chunk}");
        }
    });

    let finished = tokio::select! {
        finished = service.wait(&job_id, WAIT_POLL_INTERVAL) => finished?,
        _ = tokio::signal::ctrl_c() => {
            let outcome = service.stop_async(&job_id).await?;
            eprintln!("Interrupted, stop result: {}", outcome.as_str());
            service.status_async(&job_id).await?
        }
    };
    follow.abort();

    let results = service.results_async(&job_id).await?;
    match output {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Table => print_results(&results),
    }
    if finished.state != JobState::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_submit(
    service: &JobService,
    request: JobRequest,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id = match service.submit(&request).await {
        Ok(id) => id,
        Err(e) => fail(e),
    };
    match output {
        OutputFormat::Json => print_json(&SubmitOutput { id: &job_id })?,
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {job_id}");
        }
    }
    Ok(())
}

fn handle_list(
    service: &JobService,
    limit: usize,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = service.list(limit)?;
    match output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<34} {:<10} {:<22} {:<5} FOLDER", "JOB ID", "STATE", "UPDATED", "CPUS");
            println!("{}", "-".repeat(90));
            for job in &jobs {
                let cpus = job.cpus.map_or_else(|| "-".to_string(), |c| c.to_string());
                println!(
                    "{:<34} {:<10} {:<22} {:<5} {}",
                    job.id,
                    job.state,
                    pf_orchestrator::job::timestamp(job.updated_at),
                    cpus,
                    job.input_folder.display()
                );
            }
        }
    }
    Ok(())
}

async fn handle_logs(service: &JobService, job_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut log = match service.subscribe_log(job_id) {
        Ok(log) => log,
        Err(e) => fail(e),
    };
    while let Some(chunk) = log.next().await {
        print!("{chunk}");
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Commands::RunJob(worker) = &args.command {
        // stderr is the job log here
        init_tracing(false);
        match run_worker(worker).await {
            Ok(state) => tracing::info!(job_id = %worker.job_id, state = %state, "Job process exiting"),
            Err(e) => {
                tracing::error!(job_id = %worker.job_id, error = %e, "Job process failed");
                std::process::exit(1);
            }
        }
        return Ok(());
    }
    init_tracing(true);

    match args.command {
        Commands::Serve { host, port, engine } => {
            let service = build_service(args.store, Some(engine.to_config()))?;
            handle_serve(service, &host, port).await?;
        }
        Commands::Run(request) => {
            let service = build_service(args.store, Some(request.engine.to_config()))?;
            handle_run(&service, request.to_request(), &args.output).await?;
        }
        Commands::Submit(request) => {
            let service = build_service(args.store, Some(request.engine.to_config()))?;
            handle_submit(&service, request.to_request(), &args.output).await?;
        }
        Commands::Status { job_id } => {
            let service = build_service(args.store, None)?;
            let job = service.status(&job_id).unwrap_or_else(|e| fail(e));
            match args.output {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Table => print_summary(&job),
            }
        }
        Commands::List { limit } => {
            let service = build_service(args.store, None)?;
            handle_list(&service, limit, &args.output)?;
        }
        Commands::Results { job_id } => {
            let service = build_service(args.store, None)?;
            let results = service.results(&job_id).unwrap_or_else(|e| fail(e));
            match args.output {
                OutputFormat::Json => print_json(&results)?,
                OutputFormat::Table => print_results(&results),
            }
        }
        Commands::Stop { job_id } => {
            let service = build_service(args.store, None)?;
            let outcome = service.stop(&job_id).unwrap_or_else(|e| fail(e));
            match args.output {
                OutputFormat::Json => print_json(&ActionOutput {
                    status: outcome.as_str(),
                    job_id: &job_id,
                })?,
                OutputFormat::Table => println!("{job_id}: {}", outcome.as_str()),
            }
        }
        Commands::Delete { job_id } => {
            let service = build_service(args.store, None)?;
            service.delete(&job_id).unwrap_or_else(|e| fail(e));
            match args.output {
                OutputFormat::Json => print_json(&ActionOutput {
                    status: "deleted",
                    job_id: &job_id,
                })?,
                OutputFormat::Table => println!("Job {job_id} deleted"),
            }
        }
        Commands::Logs { job_id } => {
            let service = build_service(args.store, None)?;
            handle_logs(&service, &job_id).await?;
        }
        Commands::RunJob(_) => {}
    }

    Ok(())
}
