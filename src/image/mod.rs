//! Image re-encoder and content-addressed cache.
//!
//! Remote images are fetched once per conversion parameters, flattened onto
//! white, shrunk to fit the client's screen and optionally turned into
//! dithered 1-bit GIFs. Results land in a cache directory that is emptied
//! when the process starts and are served from `/cached_image/<file>`.
//!
//! Every failure here is recovered: undecodable images pass through
//! unchanged and a failed fetch yields `None`.

pub mod optimize;
pub mod svg;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, GatewayError};
use crate::http_client::{Fetcher, UpstreamRequest};
use crate::transcode::InlineImageSink;

/// Path prefix cached images are served under.
pub const CACHE_ROUTE: &str = "/cached_image/";

/// Recovered image failures.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to render SVG: {0}")]
    Svg(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container format of converted images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    #[serde(alias = "GIF")]
    Gif,
    #[serde(alias = "PNG")]
    Png,
    #[serde(alias = "JPEG", alias = "jpg", alias = "JPG")]
    Jpeg,
    #[serde(alias = "BMP")]
    Bmp,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gif => "gif",
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Bmp => "bmp",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Gif => image::ImageFormat::Gif,
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Bmp => image::ImageFormat::Bmp,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// How grayscale becomes black and white.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dithering {
    #[default]
    #[serde(alias = "FLOYDSTEINBERG", alias = "floydsteinberg")]
    FloydSteinberg,
    /// Plain 50% threshold, no error diffusion.
    #[serde(alias = "NONE", alias = "none")]
    Threshold,
}

/// Conversion parameters. Part of every cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    pub resize: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub convert: bool,
    pub target_format: TargetFormat,
    pub dithering: Dithering,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            resize: false,
            max_width: 512,
            max_height: 342,
            convert: false,
            target_format: TargetFormat::Gif,
            dithering: Dithering::FloydSteinberg,
        }
    }
}

impl ImageOptions {
    fn fingerprint(&self) -> String {
        format!(
            "resize={};max={}x{};convert={};format={};dither={:?}",
            self.resize,
            self.max_width,
            self.max_height,
            self.convert,
            self.target_format,
            self.dithering
        )
    }

    /// Whether any re-encoding happens at all.
    pub fn is_active(&self) -> bool {
        self.resize || self.convert
    }
}

/// A cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    /// `<sha256 hex>.<ext>`
    pub file_name: String,
    /// Source URL, or a synthetic `inline:` reference for rendered SVG.
    pub source: String,
    pub options: ImageOptions,
}

impl CachedImage {
    /// Local URL the outer HTTP layer serves this entry from.
    pub fn url(&self) -> String {
        format!("{CACHE_ROUTE}{}", self.file_name)
    }

    pub fn mime(&self) -> String {
        mime_for(&self.file_name)
    }
}

/// MIME type for a cached file name.
pub fn mime_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

type KeyLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Content-addressed, process-lifetime image cache.
pub struct ImageCache {
    dir: PathBuf,
    options: ImageOptions,
    fetcher: Arc<dyn Fetcher>,
    inflight: KeyLocks,
}

/// Exclusive hold on one cache key. The key's lock is forgotten on drop
/// unless another caller is already waiting for it.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>, options: ImageOptions, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            dir: dir.into(),
            options,
            fetcher,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Empty the cache directory, creating it if needed. Run once at startup.
    pub fn clear(&self) -> Result<(), ConfigError> {
        let err = |source| ConfigError::Cache {
            path: self.dir.clone(),
            source,
        };
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(err)?;
        }
        std::fs::create_dir_all(&self.dir).map_err(err)?;
        info!(dir = %self.dir.display(), "Image cache cleared");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &ImageOptions {
        &self.options
    }

    /// File name for `url` under the current options.
    pub fn file_name_for_url(&self, url: &str) -> String {
        let ext = if self.options.convert {
            self.options.target_format.extension().to_string()
        } else {
            source_extension(url)
        };
        let key = format!("{url}\n{}", self.options.fingerprint());
        format!("{}.{ext}", hash_hex(key.as_bytes()))
    }

    fn file_name_for_bytes(&self, material: &[u8]) -> String {
        let mut key = material.to_vec();
        key.push(b'\n');
        key.extend_from_slice(self.options.fingerprint().as_bytes());
        let ext = if self.options.convert {
            self.options.target_format.extension()
        } else {
            "png"
        };
        format!("{}.{ext}", hash_hex(&key))
    }

    /// Resolve a `/cached_image/` file name to a path.
    ///
    /// Names that could escape the directory are rejected.
    pub fn cached_path(&self, file_name: &str) -> Option<PathBuf> {
        let valid = !file_name.is_empty()
            && !file_name.starts_with('.')
            && file_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
        valid.then(|| self.dir.join(file_name))
    }

    /// Read a cached file for serving.
    pub async fn read(&self, file_name: &str) -> Result<(Bytes, String), GatewayError> {
        let path = self
            .cached_path(file_name)
            .ok_or_else(|| GatewayError::NotFound(format!("{CACHE_ROUTE}{file_name}")))?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((Bytes::from(bytes), mime_for(file_name))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::NotFound(format!("{CACHE_ROUTE}{file_name}")))
            }
            Err(e) => Err(GatewayError::Io(e)),
        }
    }

    async fn lock_key(&self, file_name: &str) -> KeyGuard<'_> {
        let lock = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            inflight
                .entry(file_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        KeyGuard {
            locks: &self.inflight,
            key: file_name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Fetch `url`, re-encode it and cache the result.
    ///
    /// A hit returns immediately without touching the network. Concurrent
    /// calls for the same key wait for the first one. Returns `None` when the
    /// image could not be fetched or written.
    pub async fn fetch_and_cache(&self, url: &str) -> Option<CachedImage> {
        let file_name = self.file_name_for_url(url);
        let entry = CachedImage {
            file_name: file_name.clone(),
            source: url.to_string(),
            options: self.options.clone(),
        };
        let path = self.cached_path(&file_name)?;

        let _key = self.lock_key(&file_name).await;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(url, file = %file_name, "Image already cached");
            return Some(entry);
        }

        info!(url, file = %file_name, "Optimizing and caching image");
        let response = match self.fetcher.fetch(UpstreamRequest::get(url)).await {
            Ok(response) if response.status.is_success() => response,
            Ok(response) => {
                warn!(url, status = %response.status, "Image fetch returned an error status");
                return None;
            }
            Err(e) => {
                warn!(url, error = %e, "Image fetch failed");
                return None;
            }
        };

        let bytes = self.reencode(response.body).await?;
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(url, error = %e, "Failed to write cached image");
            return None;
        }
        Some(entry)
    }

    /// Cache bytes a rewriter already has, keyed by `source`.
    pub async fn store(&self, source: &str, data: &[u8]) -> Option<CachedImage> {
        let file_name = self.file_name_for_url(source);
        let path = self.cached_path(&file_name)?;
        let _key = self.lock_key(&file_name).await;

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = self.reencode(Bytes::copy_from_slice(data)).await?;
            if let Err(e) = tokio::fs::write(&path, &bytes).await {
                warn!(source, error = %e, "Failed to write cached image");
                return None;
            }
        }
        Some(CachedImage {
            file_name,
            source: source.to_string(),
            options: self.options.clone(),
        })
    }

    /// Re-encode per the options on the blocking pool, falling back to the
    /// original bytes. `None` only if the worker panicked.
    async fn reencode(&self, data: Bytes) -> Option<Vec<u8>> {
        if !self.options.is_active() {
            return Some(data.to_vec());
        }
        let options = self.options.clone();
        let result = tokio::task::spawn_blocking(move || match optimize::optimize(&data, &options) {
            Ok((bytes, _)) => bytes,
            Err(e) => {
                warn!(error = %e, "Image left unmodified");
                data.to_vec()
            }
        })
        .await;
        match result {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "Image re-encoding aborted");
                None
            }
        }
    }

    /// Render canonical SVG markup and cache the raster result.
    ///
    /// Keyed by the markup itself. Blocking: rendering and the file write
    /// run on the calling thread, so async callers go through
    /// [`store_svg_blocking`](Self::store_svg_blocking) or run the whole
    /// transcoder on the blocking pool.
    pub fn store_svg(&self, canonical_svg: &str) -> Result<CachedImage, ImageError> {
        let file_name = self.file_name_for_bytes(canonical_svg.as_bytes());
        let path = self.dir.join(&file_name);
        let entry = CachedImage {
            file_name: file_name.clone(),
            source: format!("inline:{}", &file_name[..16]),
            options: self.options.clone(),
        };
        if path.exists() {
            return Ok(entry);
        }

        let rendered = svg::rasterize(canonical_svg.as_bytes())?;
        let mut options = self.options.clone();
        if !options.convert {
            options.convert = true;
            options.target_format = TargetFormat::Png;
        }
        let (bytes, _) = optimize::optimize_decoded(&rendered, image::ImageFormat::Png, &options)?;
        std::fs::write(&path, bytes)?;
        debug!(file = %file_name, "Inline SVG rasterized");
        Ok(entry)
    }
}

impl ImageCache {
    /// [`store_svg`](Self::store_svg) on the blocking pool.
    pub async fn store_svg_blocking(self: &Arc<Self>, canonical_svg: String) -> Result<CachedImage, ImageError> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.store_svg(&canonical_svg))
            .await
            .map_err(|e| ImageError::Svg(format!("render task failed: {e}")))?
    }
}

impl InlineImageSink for ImageCache {
    fn store_inline_svg(&self, canonical_svg: &str) -> Option<String> {
        match self.store_svg(canonical_svg) {
            Ok(entry) => Some(entry.url()),
            Err(e) => {
                warn!(error = %e, "Inline SVG kept as markup");
                None
            }
        }
    }
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Extension for unconverted images, from the URL path.
fn source_extension(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    mime_guess::from_path(&path)
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .and_then(|_| Path::new(&path).extension())
        .and_then(|e| e.to_str())
        .map_or_else(|| "img".to_string(), str::to_ascii_lowercase)
}

/// Whether a URL names an image by its extension.
pub fn is_image_url(url: &str) -> bool {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime_guess::mime::IMAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::UpstreamResponse;
    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoNetwork;

    #[async_trait]
    impl Fetcher for NoNetwork {
        async fn fetch(&self, request: UpstreamRequest) -> crate::error::Result<UpstreamResponse> {
            Err(GatewayError::upstream(&request.url, "offline"))
        }
    }

    struct Garbage(AtomicUsize);

    #[async_trait]
    impl Fetcher for Garbage {
        async fn fetch(&self, request: UpstreamRequest) -> crate::error::Result<UpstreamResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"not really a png"),
                final_url: request.url,
            })
        }
    }

    fn cache(dir: &Path, options: ImageOptions, fetcher: Arc<dyn Fetcher>) -> ImageCache {
        let cache = ImageCache::new(dir.join("cache"), options, fetcher);
        cache.clear().unwrap();
        cache
    }

    #[test]
    fn keys_depend_on_url_and_parameters() {
        let tmp = tempfile::tempdir().unwrap();
        let gif = cache(tmp.path(), ImageOptions { convert: true, ..ImageOptions::default() }, Arc::new(NoNetwork));
        let png = cache(
            tmp.path(),
            ImageOptions {
                convert: true,
                target_format: TargetFormat::Png,
                ..ImageOptions::default()
            },
            Arc::new(NoNetwork),
        );
        let a = gif.file_name_for_url("http://example.com/a.png");
        assert_eq!(a, gif.file_name_for_url("http://example.com/a.png"));
        assert!(a.ends_with(".gif"));
        assert_eq!(a.len(), 64 + 4);
        assert_ne!(a, gif.file_name_for_url("http://example.com/b.png"));
        assert_ne!(
            a.trim_end_matches(".gif"),
            png.file_name_for_url("http://example.com/a.png").trim_end_matches(".png")
        );
    }

    #[test]
    fn unconverted_images_keep_their_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path(), ImageOptions::default(), Arc::new(NoNetwork));
        assert!(cache.file_name_for_url("http://example.com/photo.JPG?x=1").ends_with(".jpg"));
        assert!(cache.file_name_for_url("http://example.com/pixel").ends_with(".img"));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path(), ImageOptions::default(), Arc::new(NoNetwork));
        assert!(cache.cached_path("abc.gif").is_some());
        assert!(cache.cached_path("../etc/passwd").is_none());
        assert!(cache.cached_path("a/b.gif").is_none());
        assert!(cache.cached_path("..").is_none());
        assert!(cache.cached_path("").is_none());
    }

    #[test]
    fn clear_empties_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path(), ImageOptions::default(), Arc::new(NoNetwork));
        std::fs::write(cache.dir().join("stale.gif"), b"x").unwrap();
        cache.clear().unwrap();
        assert_eq!(std::fs::read_dir(cache.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_yields_none() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path(), ImageOptions::default(), Arc::new(NoNetwork));
        assert!(cache.fetch_and_cache("http://example.com/a.png").await.is_none());
    }

    #[tokio::test]
    async fn undecodable_bytes_pass_through_once() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(Garbage(AtomicUsize::new(0)));
        let options = ImageOptions {
            resize: true,
            convert: true,
            ..ImageOptions::default()
        };
        let cache = cache(tmp.path(), options, fetcher.clone());

        let first = cache.fetch_and_cache("http://example.com/a.png").await.unwrap();
        let second = cache.fetch_and_cache("http://example.com/a.png").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);

        let (bytes, mime) = cache.read(&first.file_name).await.unwrap();
        assert_eq!(&bytes[..], b"not really a png");
        assert_eq!(mime, "image/gif");
    }

    #[tokio::test]
    async fn missing_entries_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path(), ImageOptions::default(), Arc::new(NoNetwork));
        let err = cache.read("0000.gif").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn inline_svg_is_rendered_and_keyed_by_content() {
        let tmp = tempfile::tempdir().unwrap();
        let options = ImageOptions {
            convert: true,
            ..ImageOptions::default()
        };
        let cache = cache(tmp.path(), options, Arc::new(NoNetwork));
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="4" height="4"><rect width="4" height="2"/></svg>"#;
        let url = cache.store_inline_svg(svg).unwrap();
        assert!(url.starts_with(CACHE_ROUTE));
        assert!(url.ends_with(".gif"));
        assert_eq!(cache.store_inline_svg(svg).unwrap(), url);
        assert!(cache.store_inline_svg("<svg").is_none());
    }

    #[test]
    fn image_urls_by_extension() {
        assert!(is_image_url("http://example.com/a/b.png"));
        assert!(is_image_url("http://example.com/a.JPEG?size=2"));
        assert!(!is_image_url("http://example.com/index.html"));
        assert!(!is_image_url("http://example.com/"));
    }

    #[tokio::test]
    async fn key_locks_are_released_after_use() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(Garbage(AtomicUsize::new(0)));
        let cache = cache(tmp.path(), ImageOptions::default(), fetcher.clone());

        let (a, b) = tokio::join!(
            cache.fetch_and_cache("http://example.com/a.png"),
            cache.fetch_and_cache("http://example.com/a.png"),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
        assert!(cache.fetch_and_cache("http://example.com/b.png").await.is_some());
        assert!(cache.store("http://example.com/c.png", b"bytes").await.is_some());
        assert!(cache.fetch_and_cache("http://example.com/missing").await.is_some());

        assert!(cache.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn svg_renders_off_the_async_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(tmp.path(), ImageOptions::default(), Arc::new(NoNetwork)));
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="2" height="2"><rect width="2" height="2"/></svg>"#;
        let entry = cache.store_svg_blocking(svg.to_string()).await.unwrap();
        assert!(entry.file_name.ends_with(".png"));
        assert!(cache.store_svg_blocking("<svg".to_string()).await.is_err());
    }
}
