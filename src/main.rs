use crate::acquire::{AcquisitionHandler, Id3Tagger, MediaDirs};
use crate::archive::VideoLibraryHandler;
use crate::handlers::HTTPHandlerState;
use crate::process::SystemRunner;
use crate::status::JobStore;
use crate::worker::JobQueue;
use clap::Parser;
use tracing::{Level, event};
use tracing_subscriber::prelude::*;

mod acquire;
mod archive;
mod error;
mod handlers;
mod jobs;
mod library;
mod process;
mod status;
mod worker;

#[derive(Debug, Parser)]
#[command(about, author, version, next_line_help = true)]
struct Args {
    #[arg(long, env, default_value = "127.0.0.1")]
    /// The IP address the HTTP listener will bind to.
    listen_ip: String,

    #[arg(long, env, default_value = "22409")]
    /// The port number the HTTP listener will bind to.
    listen_port: String,

    #[arg(long, env)]
    /// File system path to the video library. Every folder directly underneath
    /// is a title, containing series folders and/or series archives.
    video_root: std::path::PathBuf,

    #[arg(long, env)]
    /// File system path in which downloaded music ends up.
    music_dir: std::path::PathBuf,

    #[arg(long, env)]
    /// File system path in which downloaded podcast episodes end up.
    podcast_dir: std::path::PathBuf,

    #[arg(long, env)]
    /// File system path in which downloaded videos end up. Defaults to
    /// 'youtube/download' inside the video library, created on demand.
    video_download_dir: Option<std::path::PathBuf>,

    #[arg(long, env, default_value = "7z")]
    /// Name of or path to the '7z' executable used to archive and extract.
    sevenzip_bin: String,

    #[arg(long, env, default_value = "yt-dlp")]
    /// Name of or path to the 'yt-dlp' executable used to acquire media.
    ytdlp_bin: String,

    #[arg(long, env)]
    /// Kill any external tool run that takes longer than this many seconds.
    /// Without it, a hanging tool blocks its queue indefinitely.
    job_timeout_secs: Option<u64>,

    #[arg(long, env, default_value = "3600")]
    /// For how many seconds the outcome of a finished job can be looked up.
    job_result_ttl_secs: u32,
}

// Error out early on if an external tool can't be called.
fn ensure_tool(program: &str, probe_arg: &str) -> anyhow::Result<()> {
    if std::process::Command::new(program)
        .arg(probe_arg)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_err()
    {
        return Err(anyhow::anyhow!(
            "No '{program}' executable found, make sure it is installed"
        ));
    }
    Ok(())
}

// Wait to observe the ctrl+c signal and cause everything to shut down properly
// by dropping the sender half of a broadcast channel (all receivers will close
// upon this event).
async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI and ENV arguments.
    let args = Args::parse();

    // Configure our tracing/logger.
    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    event!(Level::DEBUG, "Launching...");

    ensure_tool(&args.sevenzip_bin, "i")?;
    ensure_tool(&args.ytdlp_bin, "--version")?;

    let runner = SystemRunner::new(args.job_timeout_secs.map(tokio::time::Duration::from_secs));
    let store = JobStore::new(chrono::TimeDelta::seconds(i64::from(args.job_result_ttl_secs)));

    // One queue per job category. Each queue runs its jobs strictly one after
    // the other, the two queues run independently of each other.
    let (video_queue, video_worker) = JobQueue::new(
        "video",
        VideoLibraryHandler::new(runner.clone(), args.video_root.clone(), args.sevenzip_bin),
        &store,
    );
    let media_dirs = MediaDirs {
        music: args.music_dir,
        podcast: args.podcast_dir,
        video: args
            .video_download_dir
            .unwrap_or_else(|| args.video_root.join("youtube").join("download")),
    };
    let (acquisition_queue, acquisition_worker) = JobQueue::new(
        "acquisition",
        AcquisitionHandler::new(runner, Id3Tagger, media_dirs, args.ytdlp_bin)?,
        &store,
    );

    // Prepare ctrl+c signal handling: all workers hook into the broadcast channel
    // and stop consuming jobs as soon as the sender side is dropped.
    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    let video_handle = tokio::task::spawn(video_worker.run(send_shutdown.subscribe()));
    let acquisition_handle = tokio::task::spawn(acquisition_worker.run(send_shutdown.subscribe()));

    // The HTTP layer is the only producer of jobs. Note that we assume to be
    // running behind a security perimeter, so authentication is not a concern.
    let handler_state = HTTPHandlerState::new(&video_queue, &acquisition_queue, &store);
    let router = handlers::router(handler_state);

    // Spawn a tokio TCP listener on the configured listening IP and port, and pass
    // it off to axum to handle the configured HTTP routes.
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", args.listen_ip, args.listen_port)).await?;
    event!(
        Level::INFO,
        "Listening for HTTP requests on {}:{}...",
        args.listen_ip,
        args.listen_port
    );

    // Block on HTTP handler, returning upon shutdown.
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_upon_signal(send_shutdown))
        .await?;

    // Once HTTP handler completed, also wait for the queue workers to exit. Jobs
    // still pending at this point are lost.
    video_handle.await?;
    acquisition_handle.await?;

    Ok(())
}
