use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use atelier_contracts::events::EventLog;
use atelier_contracts::models::{BackendKind, GenerationParams};
use atelier_contracts::pipeline::{PipelineRequest, PipelineResponse, SourceImage};
use atelier_contracts::runs::receipts::{build_pipeline_receipt, write_receipt};
use atelier_contracts::runs::records::FileRecordStore;
use atelier_contracts::tasks::TaskHandle;
use atelier_engine::{
    ChatVisionAnalyzer, EngineConfig, GenerationCoordinator, JobListQuery, LocalDirStorage,
    PipelineDispatcher,
};

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Image and video generation job coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one pipeline request.
    Run(RunArgs),
    /// Run several pipeline requests side by side.
    Batch(BatchArgs),
    /// Submit a job and return without waiting.
    Submit(SubmitArgs),
    /// Read a task's status once.
    Status(TaskArgs),
    /// Poll a task until it finishes or the wait runs out.
    Wait(WaitArgs),
    /// List video backend jobs.
    Jobs(JobsArgs),
    /// Delete a video backend job.
    DeleteJob(DeleteJobArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    request: PathBuf,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    max_wait: Option<f64>,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "request", required = true)]
    requests: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    max_wait: Option<f64>,
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    #[arg(long)]
    model: String,
    #[arg(long)]
    prompt: String,
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct TaskArgs {
    #[arg(long)]
    backend: String,
    #[arg(long)]
    task: String,
}

#[derive(Debug, Parser)]
struct WaitArgs {
    #[command(flatten)]
    task: TaskArgs,
    #[arg(long)]
    max_wait: Option<f64>,
    #[arg(long)]
    interval: Option<f64>,
}

#[derive(Debug, Parser)]
struct JobsArgs {
    #[arg(long, default_value_t = 10)]
    limit: u32,
    #[arg(long)]
    before: Option<String>,
    #[arg(long)]
    after: Option<String>,
    #[arg(long = "status")]
    statuses: Vec<String>,
}

#[derive(Debug, Parser)]
struct DeleteJobArgs {
    #[arg(long)]
    task: String,
}

/// Request file contents: a pipeline request plus optional source image
/// paths, resolved against the file's directory.
#[derive(Debug, Deserialize)]
struct RequestFile {
    #[serde(flatten)]
    request: PipelineRequest,
    #[serde(default)]
    images: Vec<PathBuf>,
}

fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ATELIER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    match cli.command {
        Command::Run(args) => run_pipeline(&config, args),
        Command::Batch(args) => run_batch(&config, args),
        Command::Submit(args) => run_submit(&config, args),
        Command::Status(args) => run_status(&config, args),
        Command::Wait(args) => run_wait(&config, args),
        Command::Jobs(args) => run_jobs(&config, args),
        Command::DeleteJob(args) => run_delete_job(&config, args),
    }
}

fn run_pipeline(config: &EngineConfig, args: RunArgs) -> Result<i32> {
    let run_id = run_id_for(&args.out);
    let dispatcher = build_dispatcher(config, &args.out, args.events.as_deref(), &run_id, args.max_wait)?;
    let mut request = load_request(&args.request)?;
    for path in &args.images {
        request.source_images.push(SourceImage::load(path)?);
    }

    let response = dispatcher.run(&request);
    write_run_receipt(&args.out, &run_id, &request, &response)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(exit_code(&response))
}

fn run_batch(config: &EngineConfig, args: BatchArgs) -> Result<i32> {
    let run_id = run_id_for(&args.out);
    let dispatcher = build_dispatcher(config, &args.out, args.events.as_deref(), &run_id, args.max_wait)?;
    let requests = args
        .requests
        .iter()
        .map(|path| load_request(path))
        .collect::<Result<Vec<_>>>()?;
    info!(requests = requests.len(), run_id = %run_id, "batch started");

    // One OS thread per request; each blocks in its own poll loop.
    let responses: Vec<PipelineResponse> = thread::scope(|scope| {
        let handles: Vec<_> = requests
            .iter()
            .map(|request| {
                let dispatcher = &dispatcher;
                scope.spawn(move || dispatcher.run(request))
            })
            .collect();
        handles
            .into_iter()
            .zip(&requests)
            .map(|(handle, request)| {
                handle.join().unwrap_or_else(|_| {
                    warn!(model = %request.model, "pipeline thread panicked");
                    PipelineResponse {
                        success: false,
                        message: "Pipeline completed with issues".to_string(),
                        steps: Vec::new(),
                        generation_result: atelier_contracts::pipeline::GenerationResult::failed(
                            request.model.clone(),
                            "pipeline thread panicked",
                        ),
                        save_result: None,
                        analysis_result: None,
                    }
                })
            })
            .collect()
    });

    let mut rows = Vec::with_capacity(responses.len());
    for (index, (request, response)) in requests.iter().zip(&responses).enumerate() {
        let receipt_id = format!("{run_id}-{}", index + 1);
        write_run_receipt(&args.out, &receipt_id, request, response)?;
        rows.push(serde_json::to_value(response)?);
    }
    println!("{}", serde_json::to_string_pretty(&Value::Array(rows))?);
    Ok(if responses.iter().all(|row| row.success) {
        0
    } else {
        2
    })
}

fn run_submit(config: &EngineConfig, args: SubmitArgs) -> Result<i32> {
    let coordinator = GenerationCoordinator::from_config(config);
    let mut params = GenerationParams::new(args.prompt);
    for raw in &args.params {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("--param expects KEY=VALUE, got '{raw}'");
        };
        params.set(key, value)?;
    }
    let attachments = args
        .images
        .iter()
        .map(|path| SourceImage::load(path))
        .collect::<Result<Vec<_>>>()?;

    let handle = coordinator.submit_only(&args.model, &params, &attachments)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"backend": handle.backend.as_str(), "task_id": handle.id}))?
    );
    Ok(0)
}

fn run_status(config: &EngineConfig, args: TaskArgs) -> Result<i32> {
    let coordinator = GenerationCoordinator::from_config(config);
    let snapshot = coordinator.query_status(&task_handle(&args)?)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(0)
}

fn run_wait(config: &EngineConfig, args: WaitArgs) -> Result<i32> {
    let coordinator = GenerationCoordinator::from_config(config);
    let policy = coordinator
        .policy()
        .with_max_wait(seconds(args.max_wait)?)
        .with_interval(seconds(args.interval)?)?;
    let terminal = coordinator.wait_for(&task_handle(&args.task)?, policy)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "task_id": terminal.snapshot.task_id,
            "status": terminal.snapshot.status.as_str(),
            "result_refs": terminal.snapshot.result_refs,
            "queries": terminal.queries,
            "elapsed_s": terminal.elapsed.as_secs_f64(),
        }))?
    );
    Ok(0)
}

fn run_jobs(config: &EngineConfig, args: JobsArgs) -> Result<i32> {
    let coordinator = GenerationCoordinator::from_config(config);
    let listing = coordinator.list_video_jobs(&JobListQuery {
        limit: args.limit,
        before: args.before,
        after: args.after,
        statuses: args.statuses,
    })?;
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(0)
}

fn run_delete_job(config: &EngineConfig, args: DeleteJobArgs) -> Result<i32> {
    let coordinator = GenerationCoordinator::from_config(config);
    let status = coordinator.delete_video_job(&args.task)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"deleted": args.task, "status": status}))?
    );
    Ok(0)
}

fn build_dispatcher(
    config: &EngineConfig,
    out: &Path,
    events: Option<&Path>,
    run_id: &str,
    max_wait: Option<f64>,
) -> Result<PipelineDispatcher> {
    fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
    let events_path = events
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out.join("events.jsonl"));
    let coordinator = Arc::new(GenerationCoordinator::from_config(config));

    let mut dispatcher = PipelineDispatcher::new(coordinator.clone())
        .with_storage(Arc::new(LocalDirStorage::new(out.join("media"))))
        .with_metadata(Arc::new(FileRecordStore::new(out.join("records.json"))))
        .with_events(EventLog::new(events_path, run_id))
        .with_max_wait(seconds(max_wait)?);
    match &config.analyzer {
        Some(settings) => {
            dispatcher = dispatcher.with_analyzer(Arc::new(ChatVisionAnalyzer::new(
                coordinator.transport(),
                settings.clone(),
            )));
        }
        None => info!("vision analyzer not configured; analysis requests will fail"),
    }
    Ok(dispatcher)
}

fn load_request(path: &Path) -> Result<PipelineRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read request {}", path.display()))?;
    let parsed: RequestFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid pipeline request {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut request = parsed.request;
    for image in &parsed.images {
        let resolved = if image.is_absolute() {
            image.clone()
        } else {
            base.join(image)
        };
        request.source_images.push(SourceImage::load(&resolved)?);
    }
    Ok(request)
}

fn write_run_receipt(
    out: &Path,
    run_id: &str,
    request: &PipelineRequest,
    response: &PipelineResponse,
) -> Result<()> {
    let path = out.join(format!("receipt-{run_id}.json"));
    write_receipt(&path, &build_pipeline_receipt(run_id, request, response))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "receipt written");
    Ok(())
}

fn task_handle(args: &TaskArgs) -> Result<TaskHandle> {
    let Some(backend) = BackendKind::parse(&args.backend) else {
        bail!("unknown backend '{}' (expected flux or sora)", args.backend);
    };
    Ok(TaskHandle {
        backend,
        id: args.task.trim().to_string(),
    })
}

fn seconds(raw: Option<f64>) -> Result<Option<Duration>> {
    match raw {
        None => Ok(None),
        Some(value) if value.is_finite() && value >= 0.0 => Ok(Some(Duration::from_secs_f64(value))),
        Some(value) => bail!("durations must be non-negative seconds, got {value}"),
    }
}

fn run_id_for(out: &Path) -> String {
    out.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "run".to_string())
}

fn exit_code(response: &PipelineResponse) -> i32 {
    if response.success {
        0
    } else {
        2
    }
}
