use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::config::ImagePreset;
use crate::error::VmError;

fn is_remote(base: &str) -> bool {
    base.starts_with("http://") || base.starts_with("https://")
}

/// Cache file name for a remote image: the last URL path segment.
fn cache_name(url: &str) -> &str {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("image.img")
}

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), VmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| VmError::external("download", format!("error reading response body: {e}")))?;
        file.write_all(&chunk).await.map_err(|e| VmError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| VmError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Whether the base image is already available locally (no download needed).
pub fn is_cached(base: &str, cache_dir: &Path) -> bool {
    if !is_remote(base) {
        return Path::new(base).exists();
    }
    cache_dir.join(cache_name(base)).exists()
}

/// Ensure the base image is available locally, downloading if needed.
/// Local paths are used in place. Returns the path to the image file.
pub async fn ensure_base_image(base: &str, cache_dir: &Path) -> Result<PathBuf, VmError> {
    if !is_remote(base) {
        let path = PathBuf::from(base);
        if !path.exists() {
            return Err(VmError::Io {
                context: format!("base image not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        return Ok(path);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| VmError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(cache_name(base));
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(dest);
    }

    tracing::info!(url = %base, "downloading base image");

    let response = reqwest::get(base)
        .await
        .map_err(|e| VmError::external("download", format!("request to {base} failed: {e}")))?;

    if !response.status().is_success() {
        return Err(VmError::external(
            "download",
            format!("HTTP {} from {base}", response.status()),
        ));
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let tmp_path = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        pb.abandon();
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| VmError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "base image cached");

    Ok(dest)
}

/// Presets whose label or URL contains `query`, case-insensitively.
pub fn filter_images<'a>(images: &'a [ImagePreset], query: Option<&str>) -> Vec<&'a ImagePreset> {
    match query {
        Some(q) => {
            let q = q.to_lowercase();
            images
                .iter()
                .filter(|img| {
                    img.label.to_lowercase().contains(&q) || img.url.to_lowercase().contains(&q)
                })
                .collect()
        }
        None => images.iter().collect(),
    }
}

/// A downloaded image in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub file_name: String,
    pub size: u64,
}

/// Files in the image cache, sorted by name. `.part` leftovers are skipped.
pub fn list_cached(cache_dir: &Path) -> Result<Vec<CachedImage>, VmError> {
    if !cache_dir.exists() {
        return Ok(Vec::new());
    }

    let mut images: Vec<CachedImage> = std::fs::read_dir(cache_dir)
        .map_err(|e| VmError::Io {
            context: format!("reading cache directory {}", cache_dir.display()),
            source: e,
        })?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let file_name = e.file_name().into_string().ok()?;
            if file_name.ends_with(".part") {
                return None;
            }
            let size = e.metadata().ok()?.len();
            Some(CachedImage { file_name, size })
        })
        .collect();
    images.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(images)
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
