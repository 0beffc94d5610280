use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::fs;

use crate::models::{MediaKind, OutputFormat};

const FILES_DIR: &str = "files";
const WORK_DIR: &str = "work";
const CACHE_DIR: &str = "cache";
const MAX_FILENAME_CHARS: usize = 200;

static INVALID_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("valid filename pattern"));

pub async fn ensure_layout(root: &Path) -> Result<()> {
    for dir in [FILES_DIR, WORK_DIR, CACHE_DIR] {
        let path = root.join(dir);
        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    Ok(())
}

/// Cross-platform safe display name, without extension.
pub fn sanitize_filename(name: &str, unix_ts: i64) -> String {
    let replaced = INVALID_FILENAME_CHARS.replace_all(name, "_");
    let truncated: String = replaced.chars().take(MAX_FILENAME_CHARS).collect();
    let trimmed = truncated.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        format!("audio_snippet_{unix_ts}")
    } else {
        trimmed.to_string()
    }
}

pub fn display_file_name(base_name: &str, format: OutputFormat) -> String {
    format!("{base_name}.{}", format.extension())
}

pub fn output_path(root: &Path, file_id: &str, display_name: &str) -> PathBuf {
    root.join(FILES_DIR).join(format!("{file_id}_{display_name}"))
}

/// Extension-less download target for a job's fresh fetch.
pub fn raw_stem(root: &Path, job_id: &str, kind: MediaKind) -> PathBuf {
    root.join(WORK_DIR).join(format!("raw_{}_{job_id}", kind.noun()))
}

/// Extension-less download target for a cacheable fetch.
pub fn cache_stem(root: &Path, cache_key: &str) -> PathBuf {
    root.join(CACHE_DIR).join(cache_key)
}

pub async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// Removes every file named `<stem>.*`, which covers a fetcher's finished
/// download as well as its partial and fragment files.
pub async fn remove_stem_files(stem: &Path) -> Result<usize> {
    let (Some(dir), Some(name)) = (stem.parent(), stem.file_name()) else {
        return Ok(0);
    };
    let prefix = format!("{}.", name.to_string_lossy());

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to list {}", dir.display()))
        }
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?
    {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            delete_file_if_exists(&entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
