pub(crate) const MAX_RETRIES: u8 = 1;

/// Implemented by every job type a queue can carry, so the queue can name the
/// action it is running in logs and in the job store.
pub(crate) trait Action {
    fn action(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ArchiveFormat {
    #[default]
    SevenZip,
    Zip,
}

impl ArchiveFormat {
    // Accepts "7z", ".zip", "ZIP", ... and falls back to 7z for anything else.
    pub(crate) fn parse(raw: &str) -> Self {
        match raw.trim().trim_start_matches('.').to_lowercase().as_str() {
            "zip" => ArchiveFormat::Zip,
            _ => ArchiveFormat::SevenZip,
        }
    }

    pub(crate) fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Zip => "zip",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{}", self.extension())
    }
}

#[derive(Clone, Debug)]
/// Compress the series folder `<video_root>/<title>/<series>` into
/// `<video_root>/<title>/<series>.<format>`.
pub(crate) struct JobArchive {
    title: String,
    series: String,
    format: ArchiveFormat,
    overwrite: bool,
}

impl JobArchive {
    pub(crate) fn new(title: String, series: String, format: ArchiveFormat, overwrite: bool) -> Self {
        Self {
            title,
            series,
            format,
            overwrite,
        }
    }

    pub(crate) fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn series(&self) -> &str {
        &self.series
    }

    pub(crate) fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub(crate) fn overwrite(&self) -> bool {
        self.overwrite
    }
}

#[derive(Clone, Debug)]
/// Decompress an archive found in the title folder, either in place or into
/// `destination` (relative to the title folder).
pub(crate) struct JobExtract {
    title: String,
    archive_name: String,
    destination: Option<String>,
    overwrite: bool,
}

impl JobExtract {
    pub(crate) fn new(
        title: String,
        archive_name: String,
        destination: Option<String>,
        overwrite: bool,
    ) -> Self {
        Self {
            title,
            archive_name,
            destination,
            overwrite,
        }
    }

    pub(crate) fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub(crate) fn destination(&self) -> Option<&str> {
        self.destination.as_deref().filter(|d| !d.is_empty())
    }

    pub(crate) fn overwrite(&self) -> bool {
        self.overwrite
    }
}

#[derive(Clone, Debug)]
/// `VideoJob` encapsulates a variant for each of the filesystem-mutating
/// actions the video library queue serializes.
pub(crate) enum VideoJob {
    Archive(JobArchive),
    Extract(JobExtract),
}

impl Action for VideoJob {
    fn action(&self) -> &'static str {
        match self {
            VideoJob::Archive(_) => "archive",
            VideoJob::Extract(_) => "extract",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ContentType {
    #[default]
    Music,
    Podcast,
    Video,
}

impl ContentType {
    pub(crate) fn is_video(self) -> bool {
        self == ContentType::Video
    }

    pub(crate) fn extension(self) -> &'static str {
        if self.is_video() { "mp4" } else { "mp3" }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "music" => Ok(ContentType::Music),
            "podcast" => Ok(ContentType::Podcast),
            "video" => Ok(ContentType::Video),
            other => Err(format!(
                "Field 'type' needs to be one of: 'music', 'podcast', 'video', got '{other}'"
            )),
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            ContentType::Music => write!(f, "music"),
            ContentType::Podcast => write!(f, "podcast"),
            ContentType::Video => write!(f, "video"),
        }
    }
}

#[derive(Clone, Debug)]
/// Instruct the acquisition queue to fetch the media behind `url` into the
/// library of the given content type.
pub(crate) struct JobAcquire {
    url: String,
    content_type: ContentType,
}

impl JobAcquire {
    pub(crate) fn new(url: String, content_type: ContentType) -> Self {
        Self { url, content_type }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn content_type(&self) -> ContentType {
        self.content_type
    }
}

impl Action for JobAcquire {
    fn action(&self) -> &'static str {
        "acquire"
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
/// Success payload of the video library queue.
pub(crate) enum VideoOutcome {
    Archived {
        archive_path: std::path::PathBuf,
        title: String,
        series: String,
        job_id: String,
    },
    Extracted {
        archive_path: std::path::PathBuf,
        destination: std::path::PathBuf,
        title: String,
        series: String,
        job_id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AcquireStatus {
    Cached,
    Success,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
/// Success payload of the acquisition queue.
pub(crate) struct AcquireOutcome {
    pub(crate) status: AcquireStatus,
    pub(crate) title: String,
    pub(crate) content_type: ContentType,
    pub(crate) file_path: std::path::PathBuf,
}
