use crate::error::JobError;
use std::path::{Component, Path, PathBuf};

// Compression extensions recognized when mapping an archive back to its series
// name. Longer compound extensions come before their suffixes.
pub(crate) const ARCHIVE_EXTENSIONS: [&str; 11] = [
    "7z", "zip", "rar", "tar", "tar.gz", "tgz", "tar.bz2", "tbz2", "tar.xz", "txz", "wim",
];

/// Recover the series name from an archive's file name by stripping a known
/// compression extension (case-insensitive). Unknown extensions fall back to
/// the plain file stem.
pub(crate) fn archive_base_name(archive_name: &str) -> String {
    let lower = archive_name.to_lowercase();

    // Check compound extensions first so "x.tar.gz" doesn't end up as "x.tar".
    let mut extensions = ARCHIVE_EXTENSIONS;
    extensions.sort_by_key(|ext| std::cmp::Reverse(ext.len()));

    for ext in extensions {
        let suffix = format!(".{ext}");
        if lower.ends_with(&suffix) && lower.len() > suffix.len() {
            let cut = archive_name.len().saturating_sub(suffix.len());
            if let Some(base) = archive_name.get(..cut) {
                return base.to_string();
            }
        }
    }

    Path::new(archive_name)
        .file_stem()
        .map_or_else(|| archive_name.to_string(), |s| s.to_string_lossy().into_owned())
}

/// Ensure that a user-supplied name addresses exactly one entry inside its
/// parent folder, i.e. it contains no separators and is not `.` or `..`.
pub(crate) fn validate_component(field: &str, value: &str) -> Result<(), JobError> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == value => Ok(()),
        _ => Err(JobError::Validation(format!(
            "Field '{field}' must be a single folder or file name, got '{value}'"
        ))),
    }
}

/// Whether `path` exists and is a folder. Errors count as "no".
pub(crate) async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

/// Locate the archive for `archive_name` inside `title_root`. Tries the name
/// literally first, then looks for `<base>.<ext>` for every known extension,
/// ignoring case.
pub(crate) async fn find_archive_file(
    title_root: &Path,
    archive_name: &str,
) -> std::io::Result<Option<PathBuf>> {
    let direct = title_root.join(archive_name);
    if tokio::fs::metadata(&direct).await.is_ok_and(|m| m.is_file()) {
        return Ok(Some(direct));
    }

    let base = archive_base_name(archive_name).to_lowercase();
    let candidates: Vec<String> = ARCHIVE_EXTENSIONS
        .iter()
        .map(|ext| format!("{base}.{ext}"))
        .collect();

    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(title_root).await?;
    while let Some(entry) = dir.next_entry().await? {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    // Deterministic pick when several archives share a base name.
    entries.sort();

    for ext_candidate in &candidates {
        if let Some(file) = entries.iter().find(|f| f.to_lowercase() == *ext_candidate) {
            return Ok(Some(title_root.join(file)));
        }
    }

    Ok(None)
}

/// Resolve `.` and `..` components without touching the filesystem, the path
/// in question usually doesn't exist yet.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
