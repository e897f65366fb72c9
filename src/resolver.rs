//! Metadata resolution and raw stream download.
//!
//! Two interchangeable adapters implement [`MetadataResolver`]:
//!
//! * [`YtDlpResolver`] shells out to `yt-dlp` for both metadata and stream
//!   downloads.
//! * [`InvidiousResolver`] talks to an Invidious-compatible HTTP API in
//!   process and downloads streams straight from the URLs it advertises.
//!
//! Which one runs is a configuration choice; the coordinator only sees the
//! trait object.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, task};
use tracing::debug;

use crate::media::{StreamDescriptor, VideoMetadata, parse_source_url};

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Short adapter name used in log lines.
    fn name(&self) -> &'static str;

    /// Looks up title, author, duration and the available streams for `url`.
    async fn resolve(&self, url: &str) -> Result<VideoMetadata>;

    /// Writes the raw bytes of `stream` to `dest`.
    async fn download_stream(
        &self,
        url: &str,
        stream: &StreamDescriptor,
        dest: &Path,
    ) -> Result<()>;
}

/// `yt-dlp` child-process adapter.
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

/// The parts of `yt-dlp --dump-single-json` we read. Everything is optional
/// because older or region-limited videos omit fields freely.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: Option<String>,
    format_note: Option<String>,
    height: Option<u32>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
    abr: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }
        command
    }
}

#[async_trait]
impl MetadataResolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn resolve(&self, url: &str) -> Result<VideoMetadata> {
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--")
            .arg(url)
            .output()
            .await
            .with_context(|| format!("running {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{}",
                last_error_line(&output.stderr)
                    .unwrap_or_else(|| format!("metadata command exited with {}", output.status))
            );
        }

        let info: YtDlpInfo =
            serde_json::from_slice(&output.stdout).context("deserializing metadata JSON")?;
        Ok(info.into_metadata(url))
    }

    async fn download_stream(
        &self,
        url: &str,
        stream: &StreamDescriptor,
        dest: &Path,
    ) -> Result<()> {
        debug!(format = %stream.id, dest = %dest.display(), "fetching stream with yt-dlp");
        let output = self
            .command()
            .arg("--format")
            .arg(&stream.id)
            .arg("--output")
            .arg(dest)
            .arg("--no-part")
            .arg("--force-overwrites")
            .arg("--")
            .arg(url)
            .stdout(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{}",
                last_error_line(&output.stderr).unwrap_or_else(|| format!(
                    "stream download for format {} exited with {}",
                    stream.id, output.status
                ))
            );
        }
        if !tokio::fs::try_exists(dest).await.unwrap_or(false) {
            bail!("stream download finished but {} is missing", dest.display());
        }
        Ok(())
    }
}

impl YtDlpInfo {
    fn into_metadata(self, url: &str) -> VideoMetadata {
        let title = self
            .fulltitle
            .or(self.title)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "video".to_owned());

        let streams = self
            .formats
            .into_iter()
            .filter_map(YtDlpFormat::into_descriptor)
            .collect();

        VideoMetadata {
            url: url.to_owned(),
            title,
            duration_seconds: self.duration.map(|d| d.round().max(0.0) as u64),
            author: self.uploader.or(self.channel),
            thumbnail_url: self.thumbnail,
            streams,
        }
    }
}

impl YtDlpFormat {
    /// Storyboards and other formats that carry neither track are dropped.
    fn into_descriptor(self) -> Option<StreamDescriptor> {
        let id = self.format_id.filter(|id| !id.trim().is_empty())?;
        let has_video = codec_present(self.vcodec.as_deref());
        let has_audio = codec_present(self.acodec.as_deref());
        if !has_video && !has_audio {
            return None;
        }
        let mime_type = self
            .ext
            .as_deref()
            .map(|ext| mime_from_extension(ext, has_video));

        Some(StreamDescriptor {
            id,
            quality_label: self.format_note,
            height: self.height,
            mime_type,
            ext: self.ext,
            has_video,
            has_audio,
            bitrate_kbps: self.tbr.or(self.abr),
            file_size: self.filesize.or(self.filesize_approx),
            url: None,
        })
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
}

/// Guesses the MIME type of a stream from its container extension.
fn mime_from_extension(ext: &str, has_video: bool) -> String {
    match (ext, has_video) {
        ("mp4", true) => "video/mp4".to_owned(),
        ("webm", true) => "video/webm".to_owned(),
        ("mkv", true) => "video/x-matroska".to_owned(),
        ("m4a", _) | ("mp4", false) => "audio/mp4".to_owned(),
        ("webm", false) => "audio/webm".to_owned(),
        ("mp3", _) => "audio/mpeg".to_owned(),
        (other, true) => format!("video/{other}"),
        (other, false) => format!("audio/{other}"),
    }
}

/// yt-dlp prints `ERROR: ...` as the last stderr line on failure; that line is
/// what users get to see.
fn last_error_line(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("ERROR:").trim().to_owned())
}

/// In-process adapter for the Invidious `/api/v1/videos/{id}` endpoint.
#[derive(Clone)]
pub struct InvidiousResolver {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousVideo {
    title: Option<String>,
    author: Option<String>,
    length_seconds: Option<u64>,
    #[serde(default)]
    video_thumbnails: Vec<InvidiousThumbnail>,
    #[serde(default)]
    format_streams: Vec<InvidiousFormat>,
    #[serde(default)]
    adaptive_formats: Vec<InvidiousFormat>,
}

#[derive(Debug, Deserialize)]
struct InvidiousThumbnail {
    quality: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousFormat {
    url: Option<String>,
    itag: Option<String>,
    #[serde(rename = "type")]
    mime: Option<String>,
    container: Option<String>,
    quality_label: Option<String>,
    resolution: Option<String>,
    size: Option<String>,
    bitrate: Option<String>,
    clen: Option<String>,
}

impl InvidiousResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(timeout)
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            agent,
        }
    }

    fn fetch_video(&self, video_id: &str) -> Result<InvidiousVideo> {
        let endpoint = format!("{}/api/v1/videos/{video_id}", self.base_url);
        let response = self.agent.get(&endpoint).call().map_err(|err| match err {
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_json::<serde_json::Value>()
                    .ok()
                    .and_then(|body| body["error"].as_str().map(str::to_owned))
                    .unwrap_or_else(|| format!("metadata API returned status {code}"));
                anyhow!(message)
            }
            other => anyhow!(other).context(format!("requesting {endpoint}")),
        })?;
        response
            .into_json::<InvidiousVideo>()
            .context("deserializing metadata API response")
    }
}

#[async_trait]
impl MetadataResolver for InvidiousResolver {
    fn name(&self) -> &'static str {
        "invidious"
    }

    async fn resolve(&self, url: &str) -> Result<VideoMetadata> {
        let source = parse_source_url(url).ok_or_else(|| anyhow!("not a YouTube video URL"))?;
        let this = self.clone();
        let video = task::spawn_blocking(move || this.fetch_video(&source.video_id))
            .await
            .context("metadata task panicked")??;
        Ok(video.into_metadata(url))
    }

    async fn download_stream(
        &self,
        _url: &str,
        stream: &StreamDescriptor,
        dest: &Path,
    ) -> Result<()> {
        let stream_url = stream
            .url
            .clone()
            .ok_or_else(|| anyhow!("stream {} has no direct URL", stream.id))?;
        let agent = self.agent.clone();
        let dest = dest.to_path_buf();
        debug!(format = %stream.id, dest = %dest.display(), "fetching stream over HTTP");

        // The copy runs detached on the blocking pool; dropping this future
        // (timeout, disconnect) raises the flag and stops it at the next chunk.
        let cancel = CancelOnDrop::default();
        let cancelled = cancel.flag();
        task::spawn_blocking(move || -> Result<()> {
            let response = agent
                .get(&stream_url)
                .call()
                .with_context(|| format!("requesting stream {stream_url}"))?;
            let mut reader = response.into_reader();
            let mut file = std::fs::File::create(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
            if let Err(err) = copy_until_cancelled(&mut reader, &mut file, &cancelled) {
                drop(file);
                let _ = std::fs::remove_file(&dest);
                return Err(err).with_context(|| format!("writing {}", dest.display()));
            }
            Ok(())
        })
        .await
        .context("stream download task panicked")?
    }
}

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl CancelOnDrop {
    fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn copy_until_cancelled(
    reader: &mut impl Read,
    writer: &mut impl Write,
    cancelled: &AtomicBool,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if cancelled.load(Ordering::Relaxed) {
            bail!("stream download cancelled after {total} bytes");
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buf[..read])?;
        total += read as u64;
    }
}

impl InvidiousVideo {
    fn into_metadata(self, url: &str) -> VideoMetadata {
        let thumbnail_url = self
            .video_thumbnails
            .iter()
            .find(|thumb| thumb.quality.as_deref() == Some("high"))
            .or_else(|| self.video_thumbnails.first())
            .and_then(|thumb| thumb.url.clone());

        let streams = self
            .format_streams
            .into_iter()
            .filter_map(|format| format.into_descriptor(true))
            .chain(
                self.adaptive_formats
                    .into_iter()
                    .filter_map(|format| format.into_descriptor(false)),
            )
            .collect();

        VideoMetadata {
            url: url.to_owned(),
            title: self
                .title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "video".to_owned()),
            duration_seconds: self.length_seconds,
            author: self.author,
            thumbnail_url,
            streams,
        }
    }
}

impl InvidiousFormat {
    /// `combined` marks entries from `formatStreams`, which always carry both
    /// tracks. Adaptive entries are split by their MIME type.
    fn into_descriptor(self, combined: bool) -> Option<StreamDescriptor> {
        let id = self.itag.filter(|itag| !itag.is_empty())?;
        let mime = self.mime.unwrap_or_default();
        let (has_video, has_audio) = if combined {
            (true, true)
        } else if mime.starts_with("video/") {
            (true, false)
        } else if mime.starts_with("audio/") {
            (false, true)
        } else {
            return None;
        };

        let height = self
            .quality_label
            .as_deref()
            .or(self.resolution.as_deref())
            .and_then(height_from_label)
            .or_else(|| self.size.as_deref().and_then(height_from_size));

        Some(StreamDescriptor {
            id,
            quality_label: self.quality_label,
            height,
            mime_type: (!mime.is_empty()).then(|| mime.split(';').next().unwrap_or("").to_owned()),
            ext: self.container,
            has_video,
            has_audio,
            bitrate_kbps: self
                .bitrate
                .and_then(|b| b.parse::<f64>().ok())
                .map(|bps| bps / 1000.0),
            file_size: self.clen.and_then(|c| c.parse().ok()),
            url: self.url,
        })
    }
}

/// `"720p60"` / `"1080p"` → height.
fn height_from_label(label: &str) -> Option<u32> {
    let digits: String = label.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !label[digits.len()..].starts_with('p') {
        return None;
    }
    digits.parse().ok()
}

/// `"640x360"` → 360.
fn height_from_size(size: &str) -> Option<u32> {
    size.split_once('x')?.1.trim().parse().ok()
}
