use crate::error::JobError;
use crate::jobs::{AcquireOutcome, AcquireStatus, ContentType, JobAcquire};
use crate::process::CommandRunner;
use crate::worker::JobHandler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Clone, Debug, PartialEq, Eq)]
/// ID3 fields written onto every audio file the acquisition queue produces.
pub(crate) struct AudioTags {
    pub(crate) title: String,
    pub(crate) artist: Option<String>,
    pub(crate) album: String,
}

/// Writes metadata tags onto a downloaded (or cached) audio file.
pub(crate) trait TagWriter: Send + Sync + 'static {
    fn write_tags(&self, path: &Path, tags: &AudioTags) -> Result<(), JobError>;
}

#[derive(Clone, Copy, Debug, Default)]
/// `TagWriter` backed by the `id3` crate. Keeps any frames already present in
/// the file and only replaces title, artist and album.
pub(crate) struct Id3Tagger;

impl TagWriter for Id3Tagger {
    fn write_tags(&self, path: &Path, tags: &AudioTags) -> Result<(), JobError> {
        use id3::TagLike;

        let mut tag = id3::Tag::read_from_path(path).unwrap_or_else(|_| id3::Tag::new());
        tag.set_title(tags.title.as_str());
        if let Some(artist) = &tags.artist {
            tag.set_artist(artist.as_str());
        }
        tag.set_album(tags.album.as_str());

        tag.write_to_path(path, id3::Version::Id3v24).map_err(|e| {
            JobError::Acquisition(format!("Failed to write ID3 tags to {}: {e}", path.display()))
        })
    }
}

#[derive(Clone, Debug)]
/// Destination folders per content type.
pub(crate) struct MediaDirs {
    pub(crate) music: PathBuf,
    pub(crate) podcast: PathBuf,
    pub(crate) video: PathBuf,
}

impl MediaDirs {
    fn for_type(&self, content_type: ContentType) -> &Path {
        match content_type {
            ContentType::Music => &self.music,
            ContentType::Podcast => &self.podcast,
            ContentType::Video => &self.video,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
// The subset of 'yt-dlp --dump-single-json' output we care about.
struct ProbeInfo {
    title: String,
    uploader: Option<String>,
    webpage_url: Option<String>,
}

/// Strip everything but word characters, whitespace, dots and hyphens from a
/// media title. Titles that end up empty get a random hex name instead.
pub(crate) fn sanitize_title(sanitize_re: &regex::Regex, raw: &str) -> String {
    let cleaned = sanitize_re.replace_all(raw, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        rand::random::<[u8; 8]>()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    } else {
        cleaned.to_string()
    }
}

#[derive(Clone, Debug)]
/// Executes acquisition jobs: probe the URL with 'yt-dlp', skip the download if
/// the target file already exists, otherwise download it, then tag audio.
pub(crate) struct AcquisitionHandler<R, T> {
    runner: R,
    tagger: Arc<T>,
    dirs: MediaDirs,
    ytdlp_bin: String,
    sanitize_re: regex::Regex,
}

impl<R: CommandRunner, T: TagWriter> AcquisitionHandler<R, T> {
    pub(crate) fn new(runner: R, tagger: T, dirs: MediaDirs, ytdlp_bin: String) -> anyhow::Result<Self> {
        Ok(Self {
            runner,
            tagger: Arc::new(tagger),
            dirs,
            ytdlp_bin,
            sanitize_re: regex::Regex::new(r"[^\w\s.-]")?,
        })
    }

    // Ask 'yt-dlp' for the media's metadata without downloading anything.
    async fn probe(&self, url: &str, cwd: &Path) -> Result<ProbeInfo, JobError> {
        let args = vec![
            "--dump-single-json".to_string(),
            "--".to_string(),
            url.to_string(),
        ];
        let output = self
            .runner
            .run(&self.ytdlp_bin, &args, cwd)
            .await
            .map_err(|e| JobError::Acquisition(format!("Probing {url} failed: {e}")))?;

        serde_json::from_str::<ProbeInfo>(&output.stdout).map_err(|e| {
            JobError::Acquisition(format!("Unexpected metadata returned for {url}: {e}"))
        })
    }

    async fn tag(&self, path: &Path, tags: AudioTags) -> Result<(), JobError> {
        let tagger = Arc::clone(&self.tagger);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || tagger.write_tags(&path, &tags))
            .await
            .map_err(|e| JobError::Acquisition(format!("Tagging task failed: {e}")))?
    }

    fn download_args(content_type: ContentType, url: &str, output_path: &Path) -> Vec<String> {
        let mut args: Vec<String> = if content_type.is_video() {
            vec![
                "-f".to_string(),
                "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/best".to_string(),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]
        } else {
            vec![
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                "0".to_string(),
            ]
        };
        args.extend([
            "--output".to_string(),
            output_path.to_string_lossy().into_owned(),
            // Never let the URL be taken for an option.
            "--".to_string(),
            url.to_string(),
        ]);
        args
    }

    async fn acquire(&self, job_id: &str, job: &JobAcquire) -> Result<AcquireOutcome, JobError> {
        let content_type = job.content_type();
        let dest_root = self.dirs.for_type(content_type);

        // 'yt-dlp' runs from within the destination, so it has to exist up front.
        tokio::fs::create_dir_all(dest_root).await?;

        let info = self.probe(job.url(), dest_root).await?;
        let title = sanitize_title(&self.sanitize_re, &info.title);
        event!(Level::DEBUG, job_id, "Resolved {} to title '{title}'", job.url());

        let file_path = dest_root.join(format!("{title}.{}", content_type.extension()));
        let tags = AudioTags {
            title: info.title.clone(),
            artist: info.uploader.clone(),
            album: info.webpage_url.clone().unwrap_or_else(|| job.url().to_string()),
        };

        if tokio::fs::try_exists(&file_path).await? {
            event!(Level::INFO, job_id, "Using cached file {file_path:?}");

            // Refresh tags even on cache hits.
            if !content_type.is_video() {
                self.tag(&file_path, tags).await?;
            }

            return Ok(AcquireOutcome {
                status: AcquireStatus::Cached,
                title,
                content_type,
                file_path,
            });
        }

        event!(Level::INFO, job_id, "Downloading {} -> {file_path:?}", job.url());

        let args = Self::download_args(content_type, job.url(), &file_path);
        if let Err(e) = self.runner.run(&self.ytdlp_bin, &args, dest_root).await {
            return Err(JobError::Acquisition(match e.exit_code() {
                Some(code) => format!("yt-dlp exit code: {code}"),
                None => e.to_string(),
            }));
        }

        if !content_type.is_video() {
            self.tag(&file_path, tags).await?;
        }

        Ok(AcquireOutcome {
            status: AcquireStatus::Success,
            title,
            content_type,
            file_path,
        })
    }
}

impl<R: CommandRunner, T: TagWriter> JobHandler for AcquisitionHandler<R, T> {
    type Job = JobAcquire;
    type Output = AcquireOutcome;

    async fn handle(&self, job_id: &str, job: &JobAcquire) -> Result<AcquireOutcome, JobError> {
        self.acquire(job_id, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::process::ProcessOutput;
    use crate::process::testing::RecordingRunner;

    #[derive(Clone, Default)]
    struct RecordingTagger {
        written: Arc<parking_lot::Mutex<Vec<(PathBuf, AudioTags)>>>,
    }

    impl TagWriter for RecordingTagger {
        fn write_tags(&self, path: &Path, tags: &AudioTags) -> Result<(), JobError> {
            self.written.lock().push((path.to_path_buf(), tags.clone()));
            Ok(())
        }
    }

    const URL: &str = "https://www.youtube.com/watch?v=0123456789a";

    fn probe_ok(title: &'static str) -> impl Fn(&crate::process::testing::Invocation) -> Result<ProcessOutput, ProcessError> {
        move |inv| {
            assert_eq!(inv.args, vec!["--dump-single-json", "--", URL]);
            Ok(ProcessOutput {
                stdout: serde_json::json!({
                    "title": title,
                    "uploader": "Some Channel",
                    "webpage_url": URL,
                    "duration": 212,
                })
                .to_string(),
                stderr: String::new(),
            })
        }
    }

    fn dirs(root: &Path) -> MediaDirs {
        MediaDirs {
            music: root.join("music"),
            podcast: root.join("podcast"),
            video: root.join("video").join("youtube").join("download"),
        }
    }

    fn setup(
        runner: &RecordingRunner,
    ) -> (
        tempfile::TempDir,
        RecordingTagger,
        AcquisitionHandler<RecordingRunner, RecordingTagger>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("music")).unwrap();
        std::fs::create_dir_all(dir.path().join("podcast")).unwrap();
        let tagger = RecordingTagger::default();
        let handler = AcquisitionHandler::new(
            runner.clone(),
            tagger.clone(),
            dirs(dir.path()),
            "yt-dlp".to_string(),
        )
        .unwrap();
        (dir, tagger, handler)
    }

    #[test]
    fn test_sanitize_title() {
        let re = regex::Regex::new(r"[^\w\s.-]").unwrap();
        assert_eq!(sanitize_title(&re, "Song: Live! (2024)"), "Song Live 2024");
        assert_eq!(sanitize_title(&re, "  a.b-c_d  "), "a.b-c_d");

        let fallback = sanitize_title(&re, "?!*");
        assert_eq!(fallback.len(), 16);
        assert!(fallback.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_download_but_tags() {
        let runner = RecordingRunner::default().then(probe_ok("My Song?"));
        let (dir, tagger, handler) = setup(&runner);
        let cached = dir.path().join("music").join("My Song.mp3");
        std::fs::write(&cached, b"mp3").unwrap();

        let outcome = handler
            .handle("1", &JobAcquire::new(URL.to_string(), ContentType::Music))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AcquireOutcome {
                status: AcquireStatus::Cached,
                title: "My Song".to_string(),
                content_type: ContentType::Music,
                file_path: cached.clone(),
            }
        );
        // Only the probe ran.
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(
            *tagger.written.lock(),
            vec![(
                cached,
                AudioTags {
                    title: "My Song?".to_string(),
                    artist: Some("Some Channel".to_string()),
                    album: URL.to_string(),
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_audio_download_and_tag() {
        let runner = RecordingRunner::default().then(probe_ok("Episode 12"));
        let (dir, tagger, handler) = setup(&runner);
        let podcast_dir = dir.path().join("podcast");

        let outcome = handler
            .handle("1", &JobAcquire::new(URL.to_string(), ContentType::Podcast))
            .await
            .unwrap();

        let expected = podcast_dir.join("Episode 12.mp3");
        assert_eq!(outcome.status, AcquireStatus::Success);
        assert_eq!(outcome.file_path, expected);

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].args,
            vec![
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                "0".to_string(),
                "--output".to_string(),
                expected.to_string_lossy().into_owned(),
                "--".to_string(),
                URL.to_string(),
            ]
        );
        assert_eq!(calls[1].cwd, podcast_dir);
        assert_eq!(tagger.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_video_download_creates_dir_and_skips_tags() {
        let runner = RecordingRunner::default().then(probe_ok("Clip"));
        let (dir, tagger, handler) = setup(&runner);
        let video_dir = dirs(dir.path()).video;

        let outcome = handler
            .handle("1", &JobAcquire::new(URL.to_string(), ContentType::Video))
            .await
            .unwrap();

        assert!(video_dir.is_dir());
        assert_eq!(outcome.file_path, video_dir.join("Clip.mp4"));
        assert_eq!(
            runner.calls()[1].args[..4],
            [
                "-f".to_string(),
                "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/best".to_string(),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]
        );
        assert!(tagger.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_is_acquisition_error() {
        let runner = RecordingRunner::default().then(|_| {
            Err(ProcessError::Exited {
                program: "yt-dlp".to_string(),
                code: Some(1),
                message: "ERROR: Unsupported URL".to_string(),
            })
        });
        let (_dir, _tagger, handler) = setup(&runner);

        let err = handler
            .handle("1", &JobAcquire::new("nope".to_string(), ContentType::Music))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Acquisition(_)));
        assert!(err.is_retryable());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_download_failure_reports_exit_code() {
        let runner = RecordingRunner::default()
            .then(probe_ok("Song"))
            .then(|_| {
                Err(ProcessError::Exited {
                    program: "yt-dlp".to_string(),
                    code: Some(2),
                    message: "network down".to_string(),
                })
            });
        let (_dir, tagger, handler) = setup(&runner);

        let err = handler
            .handle("1", &JobAcquire::new(URL.to_string(), ContentType::Music))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Acquisition failed: yt-dlp exit code: 2");
        assert!(tagger.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_option_like_url_stays_positional() {
        let url = "--exec=touch /tmp/owned";
        let runner = RecordingRunner::default().then(move |inv| {
            assert_eq!(inv.args, vec!["--dump-single-json", "--", url]);
            Ok(ProcessOutput {
                stdout: serde_json::json!({ "title": "Clip" }).to_string(),
                stderr: String::new(),
            })
        });
        let (_dir, _tagger, handler) = setup(&runner);

        handler
            .handle("1", &JobAcquire::new(url.to_string(), ContentType::Video))
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            let (last, rest) = call.args.split_last().unwrap();
            assert_eq!(last, url);
            assert_eq!(rest.last().map(String::as_str), Some("--"));
        }
    }

    #[test]
    fn test_id3_tagger_writes_frames() {
        use id3::TagLike;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.mp3");
        std::fs::write(&path, vec![0u8; 256]).unwrap();

        Id3Tagger
            .write_tags(
                &path,
                &AudioTags {
                    title: "Song".to_string(),
                    artist: Some("Artist".to_string()),
                    album: URL.to_string(),
                },
            )
            .unwrap();

        let tag = id3::Tag::read_from_path(&path).unwrap();
        assert_eq!(tag.title(), Some("Song"));
        assert_eq!(tag.artist(), Some("Artist"));
        assert_eq!(tag.album(), Some(URL));
    }
}
