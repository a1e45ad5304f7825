use anyhow::{Context, Result};
use chunk_uploader::config::{parse_pairs, parse_size};
use chunk_uploader::{
    CapabilityProfile, ChunkUploaded, ClientOptions, EventSink, FileHandle, FileId, FileRegistry,
    FileUploaded, TransferStatus, UploadConfig, UploadError, UploadProgress, Uploader,
};
use clap::Parser;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "chunkup",
    version = env!("CARGO_PKG_VERSION"),
    author = "Tyr Chen <tyr.chen@gmail.com>",
    about = "Upload files to an HTTP endpoint in chunks",
    long_about = "Uploads files to any HTTP endpoint that accepts chunked uploads. Large files are split \
                  into ranges sent one request at a time, as multipart/form-data or raw octet streams. \
                  Configure defaults via .env (UPLOAD_*) or a YAML file.",
    after_help = "Examples:\n  \
                  chunkup ./video.mp4 -u https://host/upload                   # Single request\n  \
                  chunkup ./videos -u https://host/upload --chunk-size 4MB     # Chunked directory upload\n  \
                  chunkup ./a.bin -u https://host/upload --no-multipart        # Raw octet stream\n  \
                  chunkup . -u https://host/upload -e mp4,mov -H 'X-Token: t'  # Filter and add headers\n\n\
                  Configuration (.env):\n  \
                  UPLOAD_CHUNK_SIZE=4MB\n  \
                  UPLOAD_MULTIPART=true\n  \
                  UPLOAD_FILE_FIELD=file\n  \
                  UPLOAD_HEADERS=Authorization=Bearer abc\n  \
                  UPLOAD_PARAMS=album=trip,owner=me"
)]
struct Cli {
    /// File or directory to upload
    path: PathBuf,

    /// Endpoint receiving the upload requests
    #[arg(long, short = 'u')]
    url: String,

    /// Allowed file extensions (comma-separated); all files when empty
    #[arg(long, short = 'e', value_delimiter = ',')]
    extensions: Vec<String>,

    /// Maximum number of concurrent uploads
    #[arg(long, short = 'c', default_value = "4")]
    max_concurrent: usize,

    /// Bytes per request, e.g. 512K or 4MB (0 disables chunking)
    #[arg(long)]
    chunk_size: Option<String>,

    /// Send raw octet streams instead of multipart forms
    #[arg(long)]
    no_multipart: bool,

    /// Form field carrying the file bytes
    #[arg(long)]
    field: Option<String>,

    /// Extra form fields (key=value pairs, comma-separated)
    #[arg(long)]
    param: Option<String>,

    /// Request header, "Name: value" (repeatable)
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    /// YAML configuration file (replaces UPLOAD_* environment settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Re-upload a failed file this many times
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Abort a file when a chunk response contains this text
    #[arg(long)]
    abort_on: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Never split files, whatever the chunk size
    #[arg(long)]
    no_chunking: bool,

    /// Frame multipart bodies by hand instead of building forms
    #[arg(long)]
    no_form_blobs: bool,

    /// Transport cannot send binary bodies
    #[arg(long)]
    no_binary: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug)]
struct Stats {
    uploaded: AtomicUsize,
    failed: AtomicUsize,
    stopped: AtomicUsize,
    total_bytes_uploaded: AtomicU64,
    start_time: std::time::Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            uploaded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            total_bytes_uploaded: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }
}

impl Stats {
    fn print_summary(&self) {
        let duration = self.start_time.elapsed();
        let total_bytes = self.total_bytes_uploaded.load(Ordering::Relaxed);

        println!("\n{}", style("═".repeat(70)).dim());
        println!(
            "{}",
            style(format!(
                "Summary: {} uploaded, {} failed, {} stopped",
                self.uploaded.load(Ordering::Relaxed),
                self.failed.load(Ordering::Relaxed),
                self.stopped.load(Ordering::Relaxed)
            ))
            .bold()
        );

        if total_bytes > 0 {
            println!(
                "{}",
                style(format!(
                    "Total uploaded: {} ({} bytes)",
                    format_size(total_bytes),
                    total_bytes
                ))
                .dim()
            );
        }

        if duration.as_secs() > 0 {
            let speed = total_bytes as f64 / duration.as_secs_f64() / 1024.0 / 1024.0;
            println!(
                "{}",
                style(format!(
                    "Time: {:.2}s, Average speed: {:.2} MB/s",
                    duration.as_secs_f64(),
                    speed
                ))
                .dim()
            );
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum ProcessResult {
    Uploaded {
        filename: String,
        size: String,
        attempts: u32,
        response: String,
    },
    Failed {
        filename: String,
        error: String,
    },
    Stopped {
        filename: String,
    },
}

impl ProcessResult {
    fn filename(&self) -> &str {
        match self {
            Self::Uploaded { filename, .. }
            | Self::Failed { filename, .. }
            | Self::Stopped { filename } => filename,
        }
    }
}

/// Drives one progress bar from the engine's events
struct ProgressSink {
    bar: ProgressBar,
    label: String,
    abort_on: Option<String>,
    aborted: AtomicBool,
    response: std::sync::Mutex<Option<String>>,
    error: std::sync::Mutex<Option<String>>,
}

impl ProgressSink {
    fn new(bar: ProgressBar, label: String, abort_on: Option<String>) -> Self {
        bar.set_message(label.clone());
        Self {
            bar,
            label,
            abort_on,
            aborted: AtomicBool::new(false),
            response: std::sync::Mutex::new(None),
            error: std::sync::Mutex::new(None),
        }
    }

    fn take_response(&self) -> Option<String> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl EventSink for ProgressSink {
    fn on_chunk_uploaded(&self, event: &mut ChunkUploaded) {
        self.bar.set_message(format!(
            "{} (chunk {}/{})",
            self.label,
            event.chunk_index + 1,
            event.total_chunks
        ));

        let Some(needle) = &self.abort_on else {
            return;
        };
        if event.response_body.contains(needle.as_str()) {
            warn!(
                "Server response for {} matched '{}', aborting",
                self.label, needle
            );
            self.aborted.store(true, Ordering::Relaxed);
            event.cancelled = true;
        }
    }

    fn on_progress(&self, event: &UploadProgress) {
        self.bar.set_position(event.bytes_loaded);
    }

    fn on_done(&self, event: &FileUploaded) {
        self.bar.set_position(self.bar.length().unwrap_or(0));
        *self.response.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(event.response_body.clone());
    }

    fn on_error(&self, event: &UploadError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.message.clone());
    }
}

/// Shared by every worker
struct Job {
    uploader: Arc<Uploader>,
    config: UploadConfig,
    url: String,
    base_path: PathBuf,
    retries: u32,
    abort_on: Option<String>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Stats>,
    multi: Arc<MultiProgress>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    info!("Chunk Upload Tool v{}", env!("CARGO_PKG_VERSION"));
    info!("Concurrent workers: {}", cli.max_concurrent);

    let config = build_config(&cli)?;
    let profile = build_profile(&cli);
    let options = ClientOptions {
        timeout: cli.timeout.map(Duration::from_secs),
        ..ClientOptions::default()
    };
    let uploader =
        Arc::new(Uploader::with_options(profile, options).context("Failed to build HTTP client")?);

    let files = collect_files(&cli.path, &cli.extensions)?;
    if files.is_empty() {
        println!("{}", style("No files to upload").yellow());
        return Ok(());
    }

    if !cli.json {
        println!(
            "{}",
            style(format!(
                "📦 Target: {} (chunk size: {})",
                cli.url,
                match config.chunk_size {
                    0 => "whole file".to_string(),
                    n => format_size(n),
                }
            ))
            .cyan()
            .bold()
        );
        println!(
            "{}",
            style(format!(
                "⚡ Uploading {} file(s) with {} workers...",
                files.len(),
                cli.max_concurrent
            ))
            .cyan()
        );
    }

    let stats = Arc::new(Stats::default());
    let (registry, mut unreadable) = register_files(&files, &cli.path, &stats).await;
    let queued: Vec<FileId> = files_in_order(&registry);
    let registry = Arc::new(registry);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let uploader = Arc::clone(&uploader);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.store(true, Ordering::Relaxed);
                let cancelled = uploader.cancel_all();
                eprintln!(
                    "{} Interrupted, cancelled {} active upload(s)",
                    style("✗").red(),
                    cancelled
                );
            }
        });
    }

    let job = Arc::new(Job {
        uploader,
        config,
        url: cli.url.clone(),
        base_path: cli.path.clone(),
        retries: cli.retries,
        abort_on: cli.abort_on.clone(),
        shutdown,
        stats: Arc::clone(&stats),
        multi: Arc::new(MultiProgress::new()),
    });

    // Create work channel and results channel
    let (work_tx, work_rx) = mpsc::channel::<FileId>(100);
    let (result_tx, mut result_rx) = mpsc::channel::<ProcessResult>(100);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let mut workers = Vec::new();
    for _ in 0..cli.max_concurrent.max(1) {
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        let job = Arc::clone(&job);
        let registry = Arc::clone(&registry);

        workers.push(tokio::spawn(async move {
            loop {
                let file_id = {
                    let mut rx_guard = work_rx.lock().await;
                    rx_guard.recv().await
                };

                match file_id {
                    Some(id) => {
                        let Some(file) = registry.get(&id) else {
                            warn!("File {} is not registered, skipping", id);
                            continue;
                        };
                        let result = process_file(&job, file).await;
                        let _ = result_tx.send(result).await;
                    }
                    None => break, // Channel closed
                }
            }
        }));
    }
    drop(result_tx);

    let collector_handle = tokio::spawn(async move {
        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        results
    });

    for id in queued {
        if work_tx.send(id).await.is_err() {
            break;
        }
    }
    drop(work_tx); // Close channel to signal workers to exit

    for worker in workers {
        if let Err(e) = worker.await {
            eprintln!("{} Worker panic: {}", style("✗").red(), e);
        }
    }

    let mut results = collector_handle
        .await
        .context("Result collector panicked")?;
    results.append(&mut unreadable);
    results.sort_by(|a, b| a.filename().cmp(b.filename()));

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!();
        print_results(&results);
        stats.print_summary();
    }

    let failed = stats.failed.load(Ordering::Relaxed);
    if failed > 0 {
        anyhow::bail!("{} upload(s) failed", failed);
    }

    Ok(())
}

/// Engine settings: YAML file or UPLOAD_* variables, then command line overrides
fn build_config(cli: &Cli) -> Result<UploadConfig> {
    let mut config = match &cli.config {
        Some(path) => UploadConfig::from_yaml_file(path)?,
        None => UploadConfig::from_env()?,
    };

    if let Some(size) = &cli.chunk_size {
        config.chunk_size = parse_size(size).context("Invalid --chunk-size")?;
    }
    if cli.no_multipart {
        config.multipart = false;
    }
    if let Some(field) = &cli.field {
        config.file_field_name = field.clone();
    }
    if let Some(params) = &cli.param {
        config.multipart_params_extra.extend(parse_pairs(params));
    }
    for header in &cli.headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header '{}' must look like 'Name: value'", header))?;
        config
            .headers
            .insert(name.trim().to_string(), value.trim().to_string());
    }

    config.validate()?;
    Ok(config)
}

fn build_profile(cli: &Cli) -> CapabilityProfile {
    let mut profile = CapabilityProfile::detect();
    if cli.no_chunking {
        profile = profile.without_chunking();
    }
    if cli.no_form_blobs {
        profile = profile.with_broken_form_blobs();
    }
    if cli.no_binary {
        profile = profile.without_binary();
    }
    profile
}

/// Open every collected file into the registry the workers share.
///
/// Files that cannot be opened are reported as failures right away.
async fn register_files(
    files: &[PathBuf],
    base_path: &Path,
    stats: &Stats,
) -> (FileRegistry, Vec<ProcessResult>) {
    let mut registry = FileRegistry::new();
    let mut unreadable = Vec::new();

    for path in files {
        if let Err(e) = registry.add_path(path).await {
            warn!("{}", e.user_message());
            stats.failed.fetch_add(1, Ordering::Relaxed);
            unreadable.push(ProcessResult::Failed {
                filename: display_name(base_path, path),
                error: e.to_string(),
            });
        }
    }

    (registry, unreadable)
}

/// Registered ids in path order, so the queue follows the directory walk
fn files_in_order(registry: &FileRegistry) -> Vec<FileId> {
    let mut handles: Vec<&FileHandle> = registry.iter().collect();
    handles.sort_by(|a, b| a.path().cmp(&b.path()));
    handles.into_iter().map(|h| h.id().clone()).collect()
}

/// Upload one file, re-running failed transfers up to `job.retries` times
async fn process_file(job: &Job, file: &FileHandle) -> ProcessResult {
    let filename = match file.path() {
        Some(path) => display_name(&job.base_path, path),
        None => file.name().to_string(),
    };

    if job.shutdown.load(Ordering::Relaxed) {
        job.stats.stopped.fetch_add(1, Ordering::Relaxed);
        return ProcessResult::Stopped { filename };
    }

    let bar = job.multi.add(ProgressBar::new(file.size()));
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        bar.set_style(bar_style.progress_chars("#>-"));
    }
    let sink = ProgressSink::new(bar, filename.clone(), job.abort_on.clone());

    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        let state = job
            .uploader
            .upload_file(file, &job.url, &job.config, &sink)
            .await;

        match state.status {
            TransferStatus::Done => {
                break ProcessResult::Uploaded {
                    filename: filename.clone(),
                    size: format_size(file.size()),
                    attempts,
                    response: sink.take_response().unwrap_or_default(),
                };
            }
            TransferStatus::Failed
                if attempts <= job.retries
                    && !sink.aborted.load(Ordering::Relaxed)
                    && !job.shutdown.load(Ordering::Relaxed) =>
            {
                let error = sink.take_error().unwrap_or_default();
                warn!(
                    "Retrying {} ({}/{}) after: {}",
                    filename, attempts, job.retries, error
                );
                sink.bar.set_position(0);
            }
            TransferStatus::Failed => {
                let error = sink
                    .take_error()
                    .or(state.last_error)
                    .unwrap_or_else(|| "upload failed".to_string());
                break ProcessResult::Failed {
                    filename: filename.clone(),
                    error,
                };
            }
            _ => {
                break ProcessResult::Stopped {
                    filename: filename.clone(),
                };
            }
        }
    };

    sink.bar.finish_and_clear();

    match &result {
        ProcessResult::Uploaded { .. } => {
            job.stats.uploaded.fetch_add(1, Ordering::Relaxed);
            job.stats
                .total_bytes_uploaded
                .fetch_add(file.size(), Ordering::Relaxed);
        }
        ProcessResult::Failed { .. } => {
            job.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        ProcessResult::Stopped { .. } => {
            job.stats.stopped.fetch_add(1, Ordering::Relaxed);
        }
    }

    result
}

fn print_results(results: &[ProcessResult]) {
    for result in results {
        match result {
            ProcessResult::Uploaded {
                filename,
                size,
                attempts,
                response,
            } => {
                let note = if *attempts > 1 {
                    format!("{}, {} attempts", size, attempts)
                } else {
                    size.clone()
                };
                println!(
                    "{} {} ({})",
                    style("✓").green(),
                    style(filename).green(),
                    style(note).dim()
                );
                if !response.is_empty() {
                    println!("  {} {}", style("↩").blue(), style(truncate(response, 120)).dim());
                }
            }
            ProcessResult::Failed { filename, error } => {
                println!(
                    "{} {} - {}",
                    style("✗").red(),
                    style(filename).red(),
                    style(error).red()
                );
            }
            ProcessResult::Stopped { filename } => {
                println!(
                    "{} {} {}",
                    style("⚠").yellow(),
                    style(filename).yellow(),
                    style("(stopped)").dim()
                );
            }
        }
    }
}

/// Collect files to upload
///
/// An empty extension list accepts every file.
fn collect_files(path: &Path, allowed_extensions: &[String]) -> Result<Vec<PathBuf>> {
    // Normalize extensions to lowercase for case-insensitive matching
    let extensions: Vec<String> = allowed_extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();

    let accepts = |file: &Path| {
        extensions.is_empty()
            || file
                .extension()
                .map(|ext| extensions.contains(&ext.to_string_lossy().to_lowercase()))
                .unwrap_or(false)
    };

    let mut files = Vec::new();
    if path.is_file() {
        if accepts(path) {
            files.push(path.to_path_buf());
        }
    } else if path.is_dir() {
        for entry in WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if accepts(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
    } else {
        anyhow::bail!("Path does not exist: {}", path.display());
    }

    Ok(files)
}

/// Path shown to the user, relative to the directory being uploaded
fn display_name(base: &Path, file: &Path) -> String {
    file.strip_prefix(base)
        .ok()
        .filter(|rel| !rel.as_os_str().is_empty())
        .unwrap_or(file)
        .to_string_lossy()
        .replace('\\', "/")
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Format file size in human-readable format
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
