use crate::jobs::{ArchiveFormat, ContentType, JobAcquire, JobArchive, JobExtract, VideoJob};
use crate::library::validate_component;
use crate::status::JobStore;
use crate::worker::{JobHandler, JobQueue};
use axum::response::IntoResponse;
use tracing::{Level, event};

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ArchiveReq {
    format: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ExtractReq {
    archive: Option<String>,
    destination: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct DownloadReq {
    url: String,
    #[serde(rename = "type")]
    content_type: Option<String>,
}

#[derive(Debug, Default, serde::Serialize)]
/// Acknowledgement returned for every submission. The job's outcome can later
/// be looked up under `job_id`.
pub(crate) struct SubmitResp {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    series: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    content_type: Option<ContentType>,
    message: String,
}

impl SubmitResp {
    fn error(message: String) -> Self {
        SubmitResp {
            status: "error".to_string(),
            message,
            ..Default::default()
        }
    }
}

/// Wraps state that each HTTP handler might need to have access to.
pub(crate) struct HTTPHandlerState<V: JobHandler, A: JobHandler> {
    video_queue: JobQueue<V>,
    acquisition_queue: JobQueue<A>,
    store: JobStore,
}

impl<V: JobHandler, A: JobHandler> Clone for HTTPHandlerState<V, A> {
    fn clone(&self) -> Self {
        HTTPHandlerState {
            video_queue: self.video_queue.clone(),
            acquisition_queue: self.acquisition_queue.clone(),
            store: self.store.clone(),
        }
    }
}

impl<V: JobHandler, A: JobHandler> HTTPHandlerState<V, A> {
    pub(crate) fn new(
        video_queue: &JobQueue<V>,
        acquisition_queue: &JobQueue<A>,
        store: &JobStore,
    ) -> Self {
        HTTPHandlerState {
            video_queue: video_queue.clone(),
            acquisition_queue: acquisition_queue.clone(),
            store: store.clone(),
        }
    }
}

static JOB_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

// Job IDs are the submission time plus a process-wide sequence number, which
// keeps them unique across both queues even within the same microsecond.
fn new_job_id() -> String {
    let seq = JOB_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!("{}-{seq}", chrono::Utc::now().timestamp_micros())
}

// Only plain web URLs are handed to 'yt-dlp'. Returns the trimmed URL.
fn validate_media_url(url: &str) -> Result<String, String> {
    let url = url.trim();
    if url.is_empty() {
        return Err("Field 'url' must not be empty".to_string());
    }

    let lower = url.to_ascii_lowercase();
    let Some(rest) = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
    else {
        event!(Level::DEBUG, "Unsupported or invalid media URL: {url}");
        return Err("Field 'url' must be an http:// or https:// URL".to_string());
    };
    if rest.is_empty() || url.chars().any(char::is_whitespace) {
        return Err("Field 'url' is not a valid URL".to_string());
    }

    Ok(url.to_string())
}

type Reply = (axum::http::StatusCode, axum::Json<SubmitResp>);

fn bad_request(message: String) -> Reply {
    (
        axum::http::StatusCode::BAD_REQUEST,
        axum::Json(SubmitResp::error(message)),
    )
}

fn queue_unavailable(e: &crate::error::QueueClosed) -> Reply {
    (
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(SubmitResp::error(e.to_string())),
    )
}

/// Handle a POST request asking to compress a series folder into an archive
/// next to it. The work happens in the background on the video queue.
pub(crate) async fn post_videos_archive<V, A>(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState<V, A>>,
    axum::extract::Path((title, series)): axum::extract::Path<(String, String)>,
    axum::Json(payload): axum::Json<ArchiveReq>,
) -> Reply
where
    V: JobHandler<Job = VideoJob>,
    A: JobHandler<Job = JobAcquire>,
{
    if let Err(e) = validate_component("title", &title)
        .and_then(|()| validate_component("series", &series))
    {
        return bad_request(e.to_string());
    }

    let format = ArchiveFormat::parse(payload.format.as_deref().unwrap_or_default());
    let job = JobArchive::new(title.clone(), series.clone(), format, payload.overwrite);
    let job_id = match state.video_queue.submit(new_job_id(), VideoJob::Archive(job)) {
        Ok(ticket) => ticket.job_id().to_string(),
        Err(e) => return queue_unavailable(&e),
    };
    event!(
        Level::DEBUG,
        "Sent archive job {job_id} for {title}/{series} to {} queue",
        state.video_queue.name()
    );

    (
        axum::http::StatusCode::ACCEPTED,
        axum::Json(SubmitResp {
            status: "processing".to_string(),
            action: Some("archive"),
            job_id: Some(job_id),
            title: Some(title),
            target: Some(format!("{series}.{format}")),
            series: Some(series),
            message: "Series added to archive queue".to_string(),
            ..Default::default()
        }),
    )
}

/// Handle a POST request asking to unpack a series archive, by default right
/// where the archive lies.
pub(crate) async fn post_videos_extract<V, A>(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState<V, A>>,
    axum::extract::Path((title, series)): axum::extract::Path<(String, String)>,
    axum::Json(payload): axum::Json<ExtractReq>,
) -> Reply
where
    V: JobHandler<Job = VideoJob>,
    A: JobHandler<Job = JobAcquire>,
{
    let archive = payload.archive.unwrap_or_else(|| series.clone());
    if let Err(e) = validate_component("title", &title)
        .and_then(|()| validate_component("archive", &archive))
    {
        return bad_request(e.to_string());
    }

    let job = JobExtract::new(
        title.clone(),
        archive.clone(),
        payload.destination,
        payload.overwrite,
    );
    let job_id = match state.video_queue.submit(new_job_id(), VideoJob::Extract(job)) {
        Ok(ticket) => ticket.job_id().to_string(),
        Err(e) => return queue_unavailable(&e),
    };
    event!(
        Level::DEBUG,
        "Sent extract job {job_id} for {title}/{archive} to {} queue",
        state.video_queue.name()
    );

    (
        axum::http::StatusCode::ACCEPTED,
        axum::Json(SubmitResp {
            status: "processing".to_string(),
            action: Some("extract"),
            job_id: Some(job_id),
            title: Some(title),
            series: Some(series),
            target: Some(archive),
            message: "Archive added to extract queue".to_string(),
            ..Default::default()
        }),
    )
}

/// Handle a POST request with a JSON payload containing a media URL to acquire
/// in the background, as music (default), podcast or video.
pub(crate) async fn post_downloads<V, A>(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState<V, A>>,
    axum::Json(payload): axum::Json<DownloadReq>,
) -> Reply
where
    V: JobHandler<Job = VideoJob>,
    A: JobHandler<Job = JobAcquire>,
{
    let url = match validate_media_url(&payload.url) {
        Ok(url) => url,
        Err(e) => return bad_request(e),
    };

    let content_type = match payload
        .content_type
        .as_deref()
        .unwrap_or_default()
        .parse::<ContentType>()
    {
        Ok(t) => t,
        Err(e) => return bad_request(e),
    };

    let job_id = match state
        .acquisition_queue
        .submit(new_job_id(), JobAcquire::new(url.clone(), content_type))
    {
        Ok(ticket) => ticket.job_id().to_string(),
        Err(e) => return queue_unavailable(&e),
    };
    event!(
        Level::DEBUG,
        "Sent {content_type} download job {job_id} for {url} to {} queue",
        state.acquisition_queue.name()
    );

    (
        axum::http::StatusCode::ACCEPTED,
        axum::Json(SubmitResp {
            status: "processing".to_string(),
            job_id: Some(job_id),
            content_type: Some(content_type),
            message: "Download added to acquisition queue".to_string(),
            ..Default::default()
        }),
    )
}

/// Report the latest known state of a job, including its result or error once
/// it finished.
pub(crate) async fn get_job<V, A>(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState<V, A>>,
    axum::extract::Path(job_id): axum::extract::Path<String>,
) -> axum::response::Response
where
    V: JobHandler<Job = VideoJob>,
    A: JobHandler<Job = JobAcquire>,
{
    match state.store.get(&job_id) {
        Some(record) => (axum::http::StatusCode::OK, axum::Json(record)).into_response(),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            axum::Json(SubmitResp::error(format!("Unknown or expired job {job_id}"))),
        )
            .into_response(),
    }
}

/// Assemble all routes of the HTTP API on top of `state`.
pub(crate) fn router<V, A>(state: HTTPHandlerState<V, A>) -> axum::Router
where
    V: JobHandler<Job = VideoJob>,
    A: JobHandler<Job = JobAcquire>,
{
    axum::Router::new()
        .without_v07_checks()
        .route(
            "/videos/{title}/{series}/archive",
            axum::routing::post(post_videos_archive::<V, A>),
        )
        .route(
            "/videos/{title}/{series}/extract",
            axum::routing::post(post_videos_extract::<V, A>),
        )
        .route("/downloads", axum::routing::post(post_downloads::<V, A>))
        .route("/jobs/{job_id}", axum::routing::get(get_job::<V, A>))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
