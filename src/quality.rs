//! Typed form of the `"<res>p-<container>"` quality token sent by clients.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Resolution {
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P2160,
}

impl Resolution {
    pub const ALL: [Resolution; 6] = [
        Self::P360,
        Self::P480,
        Self::P720,
        Self::P1080,
        Self::P1440,
        Self::P2160,
    ];

    pub fn height(self) -> u32 {
        match self {
            Self::P360 => 360,
            Self::P480 => 480,
            Self::P720 => 720,
            Self::P1080 => 1080,
            Self::P1440 => 1440,
            Self::P2160 => 2160,
        }
    }

    /// Resolutions above 1080p are reserved for premium accounts.
    pub fn is_premium_only(self) -> bool {
        matches!(self, Self::P1440 | Self::P2160)
    }

    fn parse(token: &str) -> Option<Self> {
        let digits = token.strip_suffix('p')?;
        let height: u32 = digits.parse().ok()?;
        Self::ALL.into_iter().find(|res| res.height() == height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p", self.height())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mp3,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3)
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "mp4" => Some(Self::Mp4),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quality {
    pub resolution: Resolution,
    pub container: Container,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported quality \"{0}\"; expected e.g. \"720p-mp4\" or \"360p-mp3\"")]
pub struct QualityParseError(pub String);

impl FromStr for Quality {
    type Err = QualityParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_ascii_lowercase();
        let (res, container) = value
            .split_once('-')
            .ok_or_else(|| QualityParseError(raw.to_owned()))?;
        let resolution = Resolution::parse(res).ok_or_else(|| QualityParseError(raw.to_owned()))?;
        let container =
            Container::parse(container).ok_or_else(|| QualityParseError(raw.to_owned()))?;
        Ok(Self {
            resolution,
            container,
        })
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.resolution, self.container.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tokens() {
        let q: Quality = "720p-mp4".parse().unwrap();
        assert_eq!(q.resolution, Resolution::P720);
        assert_eq!(q.container, Container::Mp4);

        let q: Quality = " 1080P-MP3 ".parse().unwrap();
        assert_eq!(q.resolution, Resolution::P1080);
        assert!(q.container.is_audio_only());
        assert_eq!(q.to_string(), "1080p-mp3");
    }

    #[test]
    fn rejects_unknown_tokens() {
        for raw in ["720-mp4", "721p-mp4", "720p-avi", "720p", "", "p-mp4", "720p-mp4-x"] {
            assert!(raw.parse::<Quality>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn premium_only_covers_high_resolutions() {
        let premium: Vec<_> = Resolution::ALL
            .into_iter()
            .filter(|res| res.is_premium_only())
            .collect();
        assert_eq!(premium, vec![Resolution::P1440, Resolution::P2160]);
    }
}
