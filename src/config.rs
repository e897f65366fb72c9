use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    account::DEFAULT_FREE_LIMIT,
    retrieval::{DEFAULT_STALE_AFTER, DEFAULT_SWEEP_INTERVAL},
    transcode::DEFAULT_AUDIO_BITRATE_KBPS,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubefetch-env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SCRATCH_ROOT: &str = "downloads";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TRANSCODE_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    YtDlp,
    Invidious,
}

impl FromStr for ResolverKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ytdlp" | "yt-dlp" => Ok(Self::YtDlp),
            "invidious" => Ok(Self::Invidious),
            other => bail!("unknown resolver \"{other}\" (expected ytdlp or invidious)"),
        }
    }
}

/// One layer of settings. The env file, the process environment and the
/// command line each produce one; later layers win in [`EnvConfig::merge`].
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub scratch_root: Option<PathBuf>,
    pub account_db: Option<PathBuf>,
    pub free_limit: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
    pub session_ttl_secs: Option<u64>,
    pub resolver: Option<ResolverKind>,
    pub invidious_url: Option<String>,
    pub ytdlp_bin: Option<PathBuf>,
    pub ytdlp_cookies: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub resolve_timeout_secs: Option<u64>,
    pub transcode_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub scratch_root: PathBuf,
    /// `None` keeps accounts in memory only.
    pub account_db: Option<PathBuf>,
    pub free_limit: u32,
    pub audio_bitrate_kbps: u32,
    pub session_ttl: Option<Duration>,
    pub resolver: ResolverKind,
    pub invidious_url: Option<String>,
    pub ytdlp_bin: PathBuf,
    pub ytdlp_cookies: Option<PathBuf>,
    pub ffmpeg_bin: PathBuf,
    pub resolve_timeout: Duration,
    pub transcode_timeout: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.apply(key.trim(), value)
                .with_context(|| format!("Parsing {} from {}", key.trim(), path.display()))?;
        }
    }
    Ok(Some(cfg))
}

/// Builds a layer from process environment variables using the same keys as
/// the env file.
pub fn env_overrides(vars: impl IntoIterator<Item = (String, String)>) -> Result<EnvConfig> {
    let mut cfg = EnvConfig::default();
    for (key, value) in vars {
        cfg.apply(&key, &value)
            .with_context(|| format!("Parsing environment variable {key}"))?;
    }
    Ok(cfg)
}

fn parse<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| anyhow!("invalid value \"{value}\": {err}"))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl EnvConfig {
    /// Sets the field for `key`. Unknown keys are ignored.
    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "TUBEFETCH_HOST" => self.host = non_empty(value),
            "TUBEFETCH_PORT" => self.port = Some(parse(value)?),
            "SCRATCH_ROOT" => self.scratch_root = non_empty(value).map(PathBuf::from),
            "ACCOUNT_DB" => self.account_db = non_empty(value).map(PathBuf::from),
            "FREE_LIMIT" => self.free_limit = Some(parse(value)?),
            "AUDIO_BITRATE_KBPS" => self.audio_bitrate_kbps = Some(parse(value)?),
            "SESSION_TTL_SECS" => self.session_ttl_secs = Some(parse(value)?),
            "RESOLVER" => self.resolver = Some(value.parse()?),
            "INVIDIOUS_URL" => self.invidious_url = non_empty(value),
            "YTDLP_BIN" => self.ytdlp_bin = non_empty(value).map(PathBuf::from),
            "YTDLP_COOKIES" => self.ytdlp_cookies = non_empty(value).map(PathBuf::from),
            "FFMPEG_BIN" => self.ffmpeg_bin = non_empty(value).map(PathBuf::from),
            "RESOLVE_TIMEOUT_SECS" => self.resolve_timeout_secs = Some(parse(value)?),
            "TRANSCODE_TIMEOUT_SECS" => self.transcode_timeout_secs = Some(parse(value)?),
            "SWEEP_INTERVAL_SECS" => self.sweep_interval_secs = Some(parse(value)?),
            "STALE_AFTER_SECS" => self.stale_after_secs = Some(parse(value)?),
            _ => {}
        }
        Ok(())
    }

    /// Fields set in `over` replace the ones in `self`.
    pub fn merge(self, over: EnvConfig) -> EnvConfig {
        EnvConfig {
            host: over.host.or(self.host),
            port: over.port.or(self.port),
            scratch_root: over.scratch_root.or(self.scratch_root),
            account_db: over.account_db.or(self.account_db),
            free_limit: over.free_limit.or(self.free_limit),
            audio_bitrate_kbps: over.audio_bitrate_kbps.or(self.audio_bitrate_kbps),
            session_ttl_secs: over.session_ttl_secs.or(self.session_ttl_secs),
            resolver: over.resolver.or(self.resolver),
            invidious_url: over.invidious_url.or(self.invidious_url),
            ytdlp_bin: over.ytdlp_bin.or(self.ytdlp_bin),
            ytdlp_cookies: over.ytdlp_cookies.or(self.ytdlp_cookies),
            ffmpeg_bin: over.ffmpeg_bin.or(self.ffmpeg_bin),
            resolve_timeout_secs: over.resolve_timeout_secs.or(self.resolve_timeout_secs),
            transcode_timeout_secs: over.transcode_timeout_secs.or(self.transcode_timeout_secs),
            sweep_interval_secs: over.sweep_interval_secs.or(self.sweep_interval_secs),
            stale_after_secs: over.stale_after_secs.or(self.stale_after_secs),
        }
    }

    /// Fills defaults and checks the combination is usable.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let resolver = self.resolver.unwrap_or(ResolverKind::YtDlp);
        if resolver == ResolverKind::Invidious && self.invidious_url.is_none() {
            bail!("RESOLVER=invidious requires INVIDIOUS_URL");
        }
        let free_limit = self.free_limit.unwrap_or(DEFAULT_FREE_LIMIT);
        let audio_bitrate_kbps = self
            .audio_bitrate_kbps
            .unwrap_or(DEFAULT_AUDIO_BITRATE_KBPS);
        if audio_bitrate_kbps == 0 {
            bail!("AUDIO_BITRATE_KBPS must be positive");
        }
        let sweep_interval = self
            .sweep_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);
        if sweep_interval.is_zero() {
            bail!("SWEEP_INTERVAL_SECS must be positive");
        }

        Ok(RuntimeConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            scratch_root: self
                .scratch_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_ROOT)),
            account_db: self.account_db,
            free_limit,
            audio_bitrate_kbps,
            session_ttl: self
                .session_ttl_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            resolver,
            invidious_url: self.invidious_url,
            ytdlp_bin: self
                .ytdlp_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
            ytdlp_cookies: self.ytdlp_cookies,
            ffmpeg_bin: self
                .ffmpeg_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN)),
            resolve_timeout: Duration::from_secs(
                self.resolve_timeout_secs
                    .unwrap_or(DEFAULT_RESOLVE_TIMEOUT_SECS),
            ),
            transcode_timeout: Duration::from_secs(
                self.transcode_timeout_secs
                    .unwrap_or(DEFAULT_TRANSCODE_TIMEOUT_SECS),
            ),
            sweep_interval,
            stale_after: self
                .stale_after_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STALE_AFTER),
        })
    }
}

/// Env file first, then the process environment, then `overrides`.
pub fn load_runtime_config_from(
    path: impl AsRef<Path>,
    overrides: EnvConfig,
) -> Result<RuntimeConfig> {
    let file = read_env_config(path.as_ref())?.unwrap_or_default();
    let env = env_overrides(std::env::vars())?;
    file.merge(env).merge(overrides).into_runtime()
}
