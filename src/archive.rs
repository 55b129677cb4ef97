use crate::error::JobError;
use crate::jobs::{JobArchive, JobExtract, VideoJob, VideoOutcome};
use crate::library::{
    archive_base_name, find_archive_file, is_dir, normalize_lexically, validate_component,
};
use crate::process::{CommandRunner, ProcessOutput};
use crate::worker::JobHandler;
use std::path::{Path, PathBuf};
use tracing::{Level, event};

fn log_tool_output(job_id: &str, output: &ProcessOutput) {
    event!(Level::DEBUG, job_id, "7z stdout: {}", output.stdout.trim());
    if !output.stderr.trim().is_empty() {
        event!(Level::DEBUG, job_id, "7z stderr: {}", output.stderr.trim());
    }
}

// Make room for an extraction into `destination`. A missing or empty folder
// is fine as is, anything else is a conflict unless `overwrite` is set.
async fn clear_destination(
    job_id: &str,
    destination: &Path,
    overwrite: bool,
) -> Result<(), JobError> {
    let Ok(meta) = tokio::fs::symlink_metadata(destination).await else {
        return Ok(());
    };

    if meta.is_dir() {
        let mut entries = tokio::fs::read_dir(destination).await?;
        if entries.next_entry().await?.is_none() {
            return Ok(());
        }
        if !overwrite {
            return Err(JobError::Conflict(
                "Destination folder is not empty. Set overwrite=true to replace it.".to_string(),
            ));
        }
        event!(
            Level::DEBUG,
            job_id,
            "Removing non-empty destination {destination:?} before extracting"
        );
        tokio::fs::remove_dir_all(destination).await?;
    } else {
        if !overwrite {
            return Err(JobError::Conflict(format!(
                "Destination {} exists and is not a folder. Set overwrite=true to replace it.",
                destination.display()
            )));
        }
        event!(
            Level::DEBUG,
            job_id,
            "Removing file {destination:?} in place of the extraction folder"
        );
        tokio::fs::remove_file(destination).await?;
    }

    Ok(())
}

#[derive(Clone, Debug)]
/// Executes archive and extract jobs against the video library rooted at
/// `video_root`, shelling out to the '7z' tool via `runner`.
pub(crate) struct VideoLibraryHandler<R> {
    runner: R,
    video_root: PathBuf,
    sevenzip_bin: String,
}

impl<R: CommandRunner> VideoLibraryHandler<R> {
    pub(crate) fn new(runner: R, video_root: PathBuf, sevenzip_bin: String) -> Self {
        Self {
            runner,
            video_root,
            sevenzip_bin,
        }
    }

    // Compress `<video_root>/<title>/<series>` into `<series>.<format>` right
    // next to the series folder.
    async fn archive(&self, job_id: &str, job: &JobArchive) -> Result<VideoOutcome, JobError> {
        validate_component("title", job.title())?;
        validate_component("series", job.series())?;

        let title_root = self.video_root.join(job.title());
        if !is_dir(&title_root).await {
            return Err(JobError::NotFound(format!(
                "Title folder not found: {}",
                title_root.display()
            )));
        }

        let source_dir = title_root.join(job.series());
        if !is_dir(&source_dir).await {
            return Err(JobError::NotFound(format!(
                "Source folder not found: {}",
                source_dir.display()
            )));
        }

        let archive_file = format!("{}.{}", job.series(), job.format().extension());
        let archive_path = title_root.join(&archive_file);

        if tokio::fs::try_exists(&archive_path).await? {
            if !job.overwrite() {
                return Err(JobError::Conflict(format!(
                    "Archive already exists: {}",
                    archive_path.display()
                )));
            }
            event!(
                Level::DEBUG,
                job_id,
                "Removing existing archive {archive_path:?} before re-archiving"
            );
            tokio::fs::remove_file(&archive_path).await?;
        }

        event!(
            Level::INFO,
            job_id,
            "Archiving {source_dir:?} -> {archive_path:?} ({})",
            job.format()
        );

        // Run from within the title folder so that the archive only contains the
        // series folder instead of its absolute path.
        let args = vec![
            "a".to_string(),
            format!("-t{}", job.format().extension()),
            archive_file,
            job.series().to_string(),
            "-mx=5".to_string(),
        ];
        let output = self.runner.run(&self.sevenzip_bin, &args, &title_root).await?;
        log_tool_output(job_id, &output);

        Ok(VideoOutcome::Archived {
            archive_path,
            title: job.title().to_string(),
            series: job.series().to_string(),
            job_id: job_id.to_string(),
        })
    }

    // Decompress the archive matching `job.archive_name()` either in place (next
    // to the archive) or into the requested destination inside the title folder.
    async fn extract(&self, job_id: &str, job: &JobExtract) -> Result<VideoOutcome, JobError> {
        validate_component("title", job.title())?;
        validate_component("archive", job.archive_name())?;

        let title_root = self.video_root.join(job.title());
        if !is_dir(&title_root).await {
            return Err(JobError::NotFound(format!(
                "Title folder not found: {}",
                title_root.display()
            )));
        }

        let Some(archive_path) = find_archive_file(&title_root, job.archive_name()).await? else {
            return Err(JobError::NotFound(format!(
                "Archive not found for {}",
                job.archive_name()
            )));
        };

        let (Some(archive_dir), Some(archive_file)) = (archive_path.parent(), archive_path.file_name())
        else {
            return Err(JobError::NotFound(format!(
                "Archive path {} has no file name",
                archive_path.display()
            )));
        };
        let archive_file = archive_file.to_string_lossy().into_owned();
        let base_name = archive_base_name(&archive_file);

        let default_destination = normalize_lexically(archive_dir);
        let destination = match job.destination() {
            Some(d) => normalize_lexically(&title_root.join(d)),
            None => default_destination.clone(),
        };

        let normalized_root = normalize_lexically(&title_root);
        if !destination.starts_with(&normalized_root) {
            return Err(JobError::Validation(
                "Destination path must stay inside the title folder".to_string(),
            ));
        }

        // Extracting "here" merges into whatever is already next to the archive,
        // wiping it would take the archive and sibling series along.
        if destination != default_destination {
            clear_destination(job_id, &destination, job.overwrite()).await?;
        }

        tokio::fs::create_dir_all(&destination).await?;

        event!(
            Level::INFO,
            job_id,
            "Extracting {archive_path:?} -> {destination:?}"
        );

        let args = vec![
            "x".to_string(),
            archive_file,
            format!("-o{}", destination.display()),
            "-y".to_string(),
        ];
        let output = self.runner.run(&self.sevenzip_bin, &args, archive_dir).await?;
        log_tool_output(job_id, &output);

        Ok(VideoOutcome::Extracted {
            archive_path,
            destination,
            title: job.title().to_string(),
            series: base_name,
            job_id: job_id.to_string(),
        })
    }
}

impl<R: CommandRunner> JobHandler for VideoLibraryHandler<R> {
    type Job = VideoJob;
    type Output = VideoOutcome;

    async fn handle(&self, job_id: &str, job: &VideoJob) -> Result<VideoOutcome, JobError> {
        match job {
            VideoJob::Archive(j) => self.archive(job_id, j).await,
            VideoJob::Extract(j) => self.extract(job_id, j).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::jobs::ArchiveFormat;
    use crate::process::testing::RecordingRunner;
    use std::path::Path;

    fn library() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let title_root = dir.path().join("Show");
        std::fs::create_dir_all(title_root.join("Season1")).unwrap();
        std::fs::write(title_root.join("Season1").join("ep01.mkv"), b"ep01").unwrap();
        (dir, title_root)
    }

    fn handler(runner: &RecordingRunner, root: &Path) -> VideoLibraryHandler<RecordingRunner> {
        VideoLibraryHandler::new(runner.clone(), root.to_path_buf(), "7z".to_string())
    }

    fn archive_job(overwrite: bool) -> VideoJob {
        VideoJob::Archive(JobArchive::new(
            "Show".to_string(),
            "Season1".to_string(),
            ArchiveFormat::SevenZip,
            overwrite,
        ))
    }

    fn extract_job(destination: Option<&str>, overwrite: bool) -> VideoJob {
        VideoJob::Extract(JobExtract::new(
            "Show".to_string(),
            "Season1".to_string(),
            destination.map(str::to_string),
            overwrite,
        ))
    }

    #[tokio::test]
    async fn test_archive_invokes_7z_from_title_folder() {
        let (dir, title_root) = library();
        let runner = RecordingRunner::default();

        let outcome = handler(&runner, dir.path())
            .handle("1", &archive_job(false))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            VideoOutcome::Archived {
                archive_path: title_root.join("Season1.7z"),
                title: "Show".to_string(),
                series: "Season1".to_string(),
                job_id: "1".to_string(),
            }
        );

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "7z");
        assert_eq!(calls[0].args, vec!["a", "-t7z", "Season1.7z", "Season1", "-mx=5"]);
        assert_eq!(calls[0].cwd, title_root);
    }

    #[tokio::test]
    async fn test_archive_zip_format() {
        let (dir, _title_root) = library();
        let runner = RecordingRunner::default();
        let job = VideoJob::Archive(JobArchive::new(
            "Show".to_string(),
            "Season1".to_string(),
            ArchiveFormat::parse("zip"),
            false,
        ));

        handler(&runner, dir.path()).handle("1", &job).await.unwrap();
        assert_eq!(
            runner.calls()[0].args,
            vec!["a", "-tzip", "Season1.zip", "Season1", "-mx=5"]
        );
    }

    #[tokio::test]
    async fn test_archive_conflict_without_overwrite() {
        let (dir, title_root) = library();
        let existing = title_root.join("Season1.7z");
        std::fs::write(&existing, b"old archive").unwrap();
        let runner = RecordingRunner::default();

        let err = handler(&runner, dir.path())
            .handle("1", &archive_job(false))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Conflict(_)));
        assert_eq!(std::fs::read(&existing).unwrap(), b"old archive");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_archive_overwrite_replaces_existing() {
        let (dir, title_root) = library();
        let existing = title_root.join("Season1.7z");
        std::fs::write(&existing, b"old archive").unwrap();

        // The fake 7z asserts the stale archive is gone and writes a fresh one.
        let runner = RecordingRunner::default().then(|inv| {
            let target = inv.cwd.join(&inv.args[2]);
            assert!(!target.exists());
            std::fs::write(&target, b"new archive").unwrap();
            Ok(crate::process::ProcessOutput::default())
        });

        handler(&runner, dir.path())
            .handle("1", &archive_job(true))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&existing).unwrap(), b"new archive");
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_archive_missing_folders() {
        let (dir, _title_root) = library();
        let runner = RecordingRunner::default();
        let h = handler(&runner, dir.path());

        let job = VideoJob::Archive(JobArchive::new(
            "Nope".to_string(),
            "Season1".to_string(),
            ArchiveFormat::SevenZip,
            false,
        ));
        assert!(matches!(h.handle("1", &job).await, Err(JobError::NotFound(_))));

        let job = VideoJob::Archive(JobArchive::new(
            "Show".to_string(),
            "Season9".to_string(),
            ArchiveFormat::SevenZip,
            false,
        ));
        assert!(matches!(h.handle("1", &job).await, Err(JobError::NotFound(_))));

        let job = VideoJob::Archive(JobArchive::new(
            "Show".to_string(),
            "../Show".to_string(),
            ArchiveFormat::SevenZip,
            false,
        ));
        assert!(matches!(h.handle("1", &job).await, Err(JobError::Validation(_))));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_archive_tool_failure_surfaces_process_error() {
        let (dir, _title_root) = library();
        let runner = RecordingRunner::default().then(|_| {
            Err(ProcessError::Exited {
                program: "7z".to_string(),
                code: Some(2),
                message: "Fatal error".to_string(),
            })
        });

        let err = handler(&runner, dir.path())
            .handle("1", &archive_job(false))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Fatal error");
    }

    #[tokio::test]
    async fn test_extract_rejects_escaping_destination() {
        let (dir, title_root) = library();
        std::fs::write(title_root.join("Season1.7z"), b"7z").unwrap();
        let runner = RecordingRunner::default();

        let err = handler(&runner, dir.path())
            .handle("1", &extract_job(Some("../../etc"), true))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Validation(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_extract_in_place_is_repeatable() {
        let (dir, title_root) = library();
        std::fs::write(title_root.join("season1.ZIP"), b"zip").unwrap();
        let runner = RecordingRunner::default();
        let h = handler(&runner, dir.path());

        for _ in 0..2 {
            let outcome = h.handle("1", &extract_job(None, false)).await.unwrap();
            assert_eq!(
                outcome,
                VideoOutcome::Extracted {
                    archive_path: title_root.join("season1.ZIP"),
                    destination: title_root.clone(),
                    title: "Show".to_string(),
                    series: "season1".to_string(),
                    job_id: "1".to_string(),
                }
            );
        }

        assert!(title_root.join("Season1").join("ep01.mkv").exists());
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].args,
            vec![
                "x".to_string(),
                "season1.ZIP".to_string(),
                format!("-o{}", title_root.display()),
                "-y".to_string(),
            ]
        );
        assert_eq!(calls[0].cwd, title_root);
    }

    #[tokio::test]
    async fn test_extract_into_non_empty_destination() {
        let (dir, title_root) = library();
        std::fs::write(title_root.join("Season1.7z"), b"7z").unwrap();
        let runner = RecordingRunner::default();
        let h = handler(&runner, dir.path());

        let err = h
            .handle("1", &extract_job(Some("Season1"), false))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        assert!(title_root.join("Season1").join("ep01.mkv").exists());
        assert!(runner.calls().is_empty());

        h.handle("2", &extract_job(Some("Season1"), true))
            .await
            .unwrap();
        assert!(title_root.join("Season1").is_dir());
        assert!(!title_root.join("Season1").join("ep01.mkv").exists());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_extract_creates_missing_destination() {
        let (dir, title_root) = library();
        std::fs::write(title_root.join("Season1.tar.gz"), b"tgz").unwrap();
        let runner = RecordingRunner::default();

        let outcome = handler(&runner, dir.path())
            .handle("1", &extract_job(Some("restored/Season1"), false))
            .await
            .unwrap();

        let expected = title_root.join("restored").join("Season1");
        assert!(expected.is_dir());
        assert!(matches!(
            outcome,
            VideoOutcome::Extracted { destination, series, .. }
                if destination == expected && series == "Season1"
        ));
    }

    #[tokio::test]
    async fn test_extract_missing_archive() {
        let (dir, _title_root) = library();
        let runner = RecordingRunner::default();

        let err = handler(&runner, dir.path())
            .handle("1", &extract_job(None, false))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_extract_onto_existing_file() {
        let (dir, title_root) = library();
        std::fs::write(title_root.join("Season1.7z"), b"7z").unwrap();
        std::fs::write(title_root.join("notes.txt"), b"notes").unwrap();
        let runner = RecordingRunner::default();
        let h = handler(&runner, dir.path());

        let err = h
            .handle("1", &extract_job(Some("notes.txt"), false))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        assert!(!err.is_retryable());
        assert_eq!(std::fs::read(title_root.join("notes.txt")).unwrap(), b"notes");
        assert!(runner.calls().is_empty());

        h.handle("2", &extract_job(Some("notes.txt"), true))
            .await
            .unwrap();
        assert!(title_root.join("notes.txt").is_dir());
        assert_eq!(runner.calls().len(), 1);
    }
}
