use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nomusic::api;
use nomusic::nomusic_core::{
    DataDirs, DownloadRequest, FormatKind, JobKind, JobStatus, SeparationEngine,
    SeparationOptions, SeparatorChoice,
};

const EXIT_FATAL: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "nomusic", about = "Local vocal separation service", version)]
struct Cli {
    /// Data root for downloads, outputs and state files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (the default when no subcommand is given).
    Serve {
        /// Port to bind on 127.0.0.1.
        #[arg(long, default_value_t = 8200)]
        port: u16,
    },
    /// Separate a file or a folder of files, blocking until done.
    Separate {
        /// Input media file.
        #[arg(long, conflicts_with = "folder")]
        file: Option<PathBuf>,
        /// Process every media file in this folder (non-recursive).
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Which separators to run.
        #[arg(long, value_parser = parse_model, default_value = "both")]
        model: SeparatorChoice,
        /// Keep the job temp directory for debugging.
        #[arg(long)]
        keep_temp: bool,
    },
    /// Download a remote video, optionally separating it afterwards.
    Download {
        url: String,
        /// Output file stem; the remote title is used when omitted.
        filename: Option<String>,
        /// Run separation on the downloaded file.
        #[arg(long = "separate")]
        separate: bool,
        /// Fetch audio only instead of video.
        #[arg(long)]
        audio: bool,
    },
}

fn parse_model(text: &str) -> Result<SeparatorChoice, String> {
    match text {
        "spleeter" => Ok(SeparatorChoice::Spleeter),
        "demucs" => Ok(SeparatorChoice::Demucs),
        "both" => Ok(SeparatorChoice::Both),
        other => Err(format!("unknown model {other:?} (spleeter|demucs|both)")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nomusic=info")),
        )
        .init();

    let cli = Cli::parse();
    let dirs = cli
        .data_dir
        .clone()
        .map(DataDirs::new)
        .unwrap_or_else(DataDirs::from_env);

    let engine = match SeparationEngine::new(dirs) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("failed to initialize: {err:#}");
            std::process::exit(EXIT_FATAL);
        }
    };

    let code = match cli.command.unwrap_or(Command::Serve { port: 8200 }) {
        Command::Serve { port } => serve(engine, port).await,
        Command::Separate {
            file,
            folder,
            model,
            keep_temp,
        } => run_separate(engine, file, folder, model, keep_temp).await,
        Command::Download {
            url,
            filename,
            separate,
            audio,
        } => run_download(engine, url, filename, separate, audio).await,
    };
    std::process::exit(code);
}

async fn serve(engine: SeparationEngine, port: u16) -> i32 {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {addr}: {err}");
            return EXIT_FATAL;
        }
    };
    tracing::info!("listening on http://{addr}");

    let shutdown_engine = engine.clone();
    let app = api::router(engine);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down, flushing queue state");
            shutdown_engine.persist_queue_now();
        })
        .await;

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("server error: {err}");
            EXIT_FATAL
        }
    }
}

/// Poll a job until it reaches a terminal state, mirroring progress to the
/// terminal. Ctrl-C cancels the job.
async fn wait_for_job(engine: &SeparationEngine, job_id: &str) -> i32 {
    let mut last_step = String::new();
    loop {
        let ctrl_c = tokio::signal::ctrl_c();
        let tick = tokio::time::sleep(Duration::from_millis(500));
        tokio::select! {
            _ = ctrl_c => {
                eprintln!("cancelling {job_id}...");
                engine.cancel(job_id);
                // Give the worker its two-stage kill window.
                for _ in 0..20 {
                    if let Some(snapshot) = engine.status(job_id)
                        && snapshot.status.is_terminal()
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                return EXIT_CANCELLED;
            }
            _ = tick => {}
        }

        let Some(snapshot) = engine.status(job_id) else {
            eprintln!("job {job_id} disappeared");
            return EXIT_FATAL;
        };
        if snapshot.current_step != last_step {
            println!("[{:>3}%] {}", snapshot.progress, snapshot.current_step);
            last_step = snapshot.current_step.clone();
        }
        match snapshot.status {
            JobStatus::Completed => {
                for file in &snapshot.result_files {
                    println!("done: {file}");
                }
                return 0;
            }
            JobStatus::Failed => {
                eprintln!(
                    "failed: {}",
                    snapshot.error.as_deref().unwrap_or("unknown error")
                );
                return EXIT_FATAL;
            }
            JobStatus::Cancelled => return EXIT_CANCELLED,
            JobStatus::Queued | JobStatus::Processing => {}
        }
    }
}

async fn run_separate(
    engine: SeparationEngine,
    file: Option<PathBuf>,
    folder: Option<PathBuf>,
    model: SeparatorChoice,
    keep_temp: bool,
) -> i32 {
    let options = SeparationOptions {
        language: None,
        keep_temp,
    };

    if let Some(file) = file {
        let engine_clone = engine.clone();
        let path = file.to_string_lossy().into_owned();
        let submitted = tokio::task::spawn_blocking(move || {
            engine_clone.submit_separation(&path, model, options)
        })
        .await;
        return match submitted {
            Ok(Ok(job_id)) => wait_for_job(&engine, &job_id).await,
            Ok(Err(err)) => {
                eprintln!("{err}");
                EXIT_FATAL
            }
            Err(join_err) => {
                eprintln!("internal error: {join_err}");
                EXIT_FATAL
            }
        };
    }

    let Some(folder) = folder else {
        eprintln!("either --file or --folder is required");
        return 2;
    };

    let engine_clone = engine.clone();
    let folder_str = folder.to_string_lossy().into_owned();
    let scanned =
        tokio::task::spawn_blocking(move || engine_clone.folder_scan(&folder_str)).await;
    let (batch_id, items) = match scanned {
        Ok(Ok(scan)) => scan,
        Ok(Err(err)) => {
            eprintln!("{err}");
            return EXIT_FATAL;
        }
        Err(join_err) => {
            eprintln!("internal error: {join_err}");
            return EXIT_FATAL;
        }
    };
    if items.is_empty() {
        println!("no media files in {}", folder.display());
        return 0;
    }
    println!("processing {} files from {}", items.len(), folder.display());
    if let Err(err) = engine.folder_process(&batch_id, model) {
        eprintln!("{err}");
        return EXIT_FATAL;
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(status) = engine.batch_status(&batch_id) else {
            eprintln!("batch {batch_id} disappeared");
            return EXIT_FATAL;
        };
        let selected = status.files.iter().filter(|f| f.selected).count();
        if status.processed >= selected {
            println!(
                "batch done: {} ok, {} failed",
                status.success, status.failed
            );
            return if status.failed == 0 { 0 } else { EXIT_FATAL };
        }
    }
}

async fn run_download(
    engine: SeparationEngine,
    url: String,
    filename: Option<String>,
    separate: bool,
    audio: bool,
) -> i32 {
    let request = DownloadRequest {
        url,
        title: filename,
        format_kind: if audio {
            FormatKind::Audio
        } else {
            FormatKind::Video
        },
        auto_separate: separate,
        ..DownloadRequest::default()
    };
    let code = match engine.submit_download(request) {
        Ok(job_id) => wait_for_job(&engine, &job_id).await,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_FATAL;
        }
    };
    if code != 0 || !separate {
        return code;
    }

    // Follow the separation job the completed download queued up.
    tokio::time::sleep(Duration::from_secs(1)).await;
    match engine.list(Some(JobKind::Separate)).last() {
        Some(job) => {
            let job_id = job.job_id.clone();
            wait_for_job(&engine, &job_id).await
        }
        None => {
            eprintln!("download finished but no separation job was queued");
            EXIT_FATAL
        }
    }
}
