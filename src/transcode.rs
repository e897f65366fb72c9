//! Container conversion: audio extraction to MP3 and video/audio muxing to MP4.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::quality::Container;

pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeTarget {
    pub container: Container,
    pub audio_bitrate_kbps: u32,
}

impl TranscodeTarget {
    pub fn new(container: Container, audio_bitrate_kbps: u32) -> Self {
        Self {
            container,
            audio_bitrate_kbps,
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Converts `inputs` (video first, when there is one) into a single file
    /// at `dest` in the target container.
    async fn transcode(
        &self,
        inputs: &[PathBuf],
        dest: &Path,
        target: TranscodeTarget,
    ) -> Result<()>;
}

/// Runs `ffmpeg` as a child process.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        inputs: &[PathBuf],
        dest: &Path,
        target: TranscodeTarget,
    ) -> Result<()> {
        let args = ffmpeg_args(inputs, dest, target)?;
        debug!(program = %self.program.display(), ?args, "starting transcode");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no diagnostic output");
            bail!("ffmpeg exited with {}: {reason}", output.status);
        }
        ensure!(
            tokio::fs::try_exists(dest).await.unwrap_or(false),
            "ffmpeg finished without producing {}",
            dest.display()
        );
        Ok(())
    }
}

/// Builds the ffmpeg argument list. Video is always stream-copied; audio is
/// re-encoded at the configured bitrate (AAC inside MP4, LAME for MP3).
fn ffmpeg_args(inputs: &[PathBuf], dest: &Path, target: TranscodeTarget) -> Result<Vec<String>> {
    ensure!(!inputs.is_empty(), "transcode needs at least one input");
    let bitrate = format!("{}k", target.audio_bitrate_kbps);
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into()];

    match target.container {
        Container::Mp3 => {
            args.extend(["-i".into(), path_arg(&inputs[0])]);
            args.extend(
                ["-vn", "-c:a", "libmp3lame", "-b:a", bitrate.as_str()]
                    .map(String::from),
            );
        }
        Container::Mp4 => match inputs {
            [single] => {
                args.extend(["-i".into(), path_arg(single)]);
                args.extend(
                    ["-c:v", "copy", "-c:a", "aac", "-b:a", bitrate.as_str()].map(String::from),
                );
            }
            [video, audio] => {
                args.extend(["-i".into(), path_arg(video), "-i".into(), path_arg(audio)]);
                args.extend(
                    [
                        "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-b:a",
                        bitrate.as_str(), "-shortest",
                    ]
                    .map(String::from),
                );
            }
            _ => bail!("cannot mux {} inputs into one mp4", inputs.len()),
        },
    }

    if target.container == Container::Mp4 {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }
    args.push(path_arg(dest));
    Ok(args)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ffmpeg");
        fs::write(&path, format!("#!/usr/bin/env bash\nset -euo pipefail\n{body}")).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    #[test]
    fn audio_args_drop_video_and_set_bitrate() {
        let args = ffmpeg_args(
            &[PathBuf::from("/s/in.webm")],
            Path::new("/s/out.mp3"),
            TranscodeTarget::new(Container::Mp3, 192),
        )
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-i /s/in.webm -vn -c:a libmp3lame -b:a 192k"));
        assert_eq!(args.last().map(String::as_str), Some("/s/out.mp3"));
        assert!(!joined.contains("faststart"));
    }

    #[test]
    fn split_inputs_are_mapped_and_video_copied() {
        let args = ffmpeg_args(
            &[PathBuf::from("v.mp4"), PathBuf::from("a.m4a")],
            Path::new("out.mp4"),
            TranscodeTarget::new(Container::Mp4, 128),
        )
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-i v.mp4 -i a.m4a -map 0:v:0 -map 1:a:0 -c:v copy -c:a aac -b:a 128k"));
        assert!(joined.ends_with("-movflags +faststart out.mp4"));
    }

    #[test]
    fn rejects_bad_input_counts() {
        let target = TranscodeTarget::new(Container::Mp4, 192);
        assert!(ffmpeg_args(&[], Path::new("o.mp4"), target).is_err());
        let three = vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")];
        assert!(ffmpeg_args(&three, Path::new("o.mp4"), target).is_err());
    }

    #[tokio::test]
    async fn stub_ffmpeg_produces_output() {
        let dir = tempdir().unwrap();
        let program = install_stub(dir.path(), "for last; do :; done\nprintf 'muxed' > \"$last\"\n");
        let input = dir.path().join("in.mp4");
        fs::write(&input, b"raw").unwrap();
        let dest = dir.path().join("out.mp4");

        FfmpegTranscoder::new(program)
            .transcode(&[input], &dest, TranscodeTarget::new(Container::Mp4, 192))
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "muxed");
    }

    #[tokio::test]
    async fn failing_ffmpeg_reports_last_stderr_line() {
        let dir = tempdir().unwrap();
        let program = install_stub(dir.path(), "echo 'Invalid data found when processing input' >&2\nexit 1\n");
        let input = dir.path().join("in.webm");
        fs::write(&input, b"raw").unwrap();

        let err = FfmpegTranscoder::new(program)
            .transcode(
                &[input],
                &dir.path().join("out.mp3"),
                TranscodeTarget::new(Container::Mp3, 192),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid data found"));
    }
}
