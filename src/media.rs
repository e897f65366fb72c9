//! Video metadata model, source URL validation and stream selection.
//!
//! Resolver adapters translate whatever their backend returns into
//! [`VideoMetadata`]; everything downstream (format selection, the
//! `/api/video-info` payload, file naming) only ever sees these structs.

use std::cmp::{Ordering, Reverse};

use serde::{Deserialize, Serialize};

use crate::quality::{Container, Quality};

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];
const SHORT_HOST: &str = "youtu.be";
const VIDEO_ID_LEN: usize = 11;
const MAX_TITLE_STEM: usize = 80;

/// One stream advertised by the extractor (a yt-dlp "format", an Invidious
/// `formatStreams`/`adaptiveFormats` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Direct media URL when the backend exposes one. The process adapter
    /// downloads by `id` instead and leaves this empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl StreamDescriptor {
    pub fn is_combined(&self) -> bool {
        self.has_video && self.has_audio
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub streams: Vec<StreamDescriptor>,
}

/// Body of `POST /api/video-info`, shaped the way the web client reads it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfoPayload {
    pub url: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: Option<u64>,
    pub author: Option<String>,
    pub formats: Vec<FormatPayload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatPayload {
    pub itag: String,
    pub quality: Option<u32>,
    pub quality_label: Option<String>,
    pub mime_type: Option<String>,
    pub container: Option<String>,
    pub content_length: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
}

impl From<&VideoMetadata> for VideoInfoPayload {
    fn from(meta: &VideoMetadata) -> Self {
        let formats = meta
            .streams
            .iter()
            .map(|stream| FormatPayload {
                itag: stream.id.clone(),
                quality: stream.height,
                quality_label: stream
                    .quality_label
                    .clone()
                    .or_else(|| stream.height.map(|h| format!("{h}p"))),
                mime_type: stream.mime_type.clone(),
                container: stream.ext.clone(),
                content_length: stream.file_size,
                has_video: stream.has_video,
                has_audio: stream.has_audio,
            })
            .collect();

        Self {
            url: meta.url.clone(),
            title: meta.title.clone(),
            thumbnail: meta.thumbnail_url.clone(),
            duration: meta.duration_seconds,
            author: meta.author.clone(),
            formats,
        }
    }
}

/// A syntactically valid YouTube video reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    pub video_id: String,
}

impl SourceUrl {
    /// Canonical watch URL handed to resolvers. Collaborators never see the
    /// raw client string.
    pub fn canonical(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

/// Parses watch, short-link, shorts, embed and live URLs. Purely syntactic: no
/// network access happens here.
pub fn parse_source_url(raw: &str) -> Option<SourceUrl> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);

    let (host, rest) = match without_scheme.find(['/', '?']) {
        Some(idx) => without_scheme.split_at(idx),
        None => (without_scheme, ""),
    };
    let host = host.to_ascii_lowercase();
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query.split('#').next().unwrap_or("")),
        None => (rest.split('#').next().unwrap_or(""), ""),
    };

    let candidate: Option<&str> = if host == SHORT_HOST {
        path.trim_start_matches('/').split('/').next()
    } else if YOUTUBE_HOSTS.contains(&host.as_str()) {
        if path == "/watch" || path == "/watch/" {
            query.split('&').find_map(|pair| pair.strip_prefix("v="))
        } else {
            ["/shorts/", "/embed/", "/live/", "/v/"]
                .iter()
                .find_map(|prefix| path.strip_prefix(*prefix))
                .and_then(|tail| tail.split('/').next())
        }
    } else {
        None
    };
    let candidate = candidate?;

    is_video_id(candidate).then(|| SourceUrl {
        video_id: candidate.to_owned(),
    })
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Streams chosen for one download.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSelection {
    /// Audio path: a single stream that carries audio.
    Audio(StreamDescriptor),
    /// Video path: a video-only stream muxed with an audio-only stream.
    Split {
        video: StreamDescriptor,
        audio: StreamDescriptor,
    },
    /// Video path when the extractor offers no separate audio track.
    Combined(StreamDescriptor),
}

impl StreamSelection {
    /// Inputs in the order the transcoder expects them (video first).
    pub fn inputs(&self) -> Vec<&StreamDescriptor> {
        match self {
            Self::Audio(stream) | Self::Combined(stream) => vec![stream],
            Self::Split { video, audio } => vec![video, audio],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no stream can supply the requested {role}")]
pub struct NoSuitableFormat {
    pub role: &'static str,
}

/// Chooses the concrete streams for `quality`. Pure function of its inputs:
/// every comparison falls back to the stream id, so the result never depends
/// on the order the extractor listed the streams in.
pub fn select_streams(
    meta: &VideoMetadata,
    quality: Quality,
) -> Result<StreamSelection, NoSuitableFormat> {
    let streams = &meta.streams;

    if quality.container.is_audio_only() {
        let combined = best_by_rank(streams.iter().filter(|s| s.is_combined()));
        let chosen = combined
            .or_else(|| best_by_rank(streams.iter().filter(|s| s.is_audio_only())))
            .ok_or(NoSuitableFormat { role: "audio" })?;
        return Ok(StreamSelection::Audio(chosen.clone()));
    }

    let target = quality.resolution.height();
    let audio = best_by_rank(streams.iter().filter(|s| s.is_audio_only()));
    let video_only: Vec<&StreamDescriptor> = streams.iter().filter(|s| s.is_video_only()).collect();

    if let (Some(audio), Some(video)) = (audio, closest_to_height(&video_only, target)) {
        return Ok(StreamSelection::Split {
            video: video.clone(),
            audio: audio.clone(),
        });
    }

    let combined: Vec<&StreamDescriptor> = streams.iter().filter(|s| s.is_combined()).collect();
    if let Some(stream) = closest_to_height(&combined, target) {
        return Ok(StreamSelection::Combined(stream.clone()));
    }

    if video_only.is_empty() {
        Err(NoSuitableFormat { role: "video" })
    } else {
        Err(NoSuitableFormat { role: "audio" })
    }
}

/// Closest height wins, ties prefer the taller stream. Falls back to the best
/// ranked stream when none of the candidates report a height.
fn closest_to_height<'a>(
    candidates: &[&'a StreamDescriptor],
    target: u32,
) -> Option<&'a StreamDescriptor> {
    let with_height = candidates
        .iter()
        .copied()
        .filter_map(|s| s.height.map(|h| (h, s)));

    let closest = with_height
        .min_by(|(ha, a), (hb, b)| {
            let key_a = (ha.abs_diff(target), Reverse(*ha));
            let key_b = (hb.abs_diff(target), Reverse(*hb));
            key_a.cmp(&key_b).then_with(|| rank(b, a))
        })
        .map(|(_, s)| s);

    closest.or_else(|| best_by_rank(candidates.iter().copied()))
}

fn best_by_rank<'a>(
    streams: impl Iterator<Item = &'a StreamDescriptor>,
) -> Option<&'a StreamDescriptor> {
    streams.max_by(|a, b| rank(a, b))
}

/// Orders streams by bitrate, then size, then height. The id comparison is
/// reversed so that, with everything else equal, the lexically smaller id
/// ranks higher.
fn rank(a: &StreamDescriptor, b: &StreamDescriptor) -> Ordering {
    let bitrate = |s: &StreamDescriptor| s.bitrate_kbps.unwrap_or(0.0);
    bitrate(a)
        .total_cmp(&bitrate(b))
        .then_with(|| a.file_size.unwrap_or(0).cmp(&b.file_size.unwrap_or(0)))
        .then_with(|| a.height.unwrap_or(0).cmp(&b.height.unwrap_or(0)))
        .then_with(|| b.id.cmp(&a.id))
}

/// Builds the user-facing file name: the title with every non-alphanumeric
/// character removed, a millisecond suffix and the container extension.
pub fn download_file_name(title: &str, container: Container, unique_suffix: i64) -> String {
    let stem: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_TITLE_STEM)
        .collect();
    let stem = if stem.is_empty() { "video" } else { stem.as_str() };
    format!("{stem}-{unique_suffix}.{}", container.extension())
}
