//! Media playlist rendering and validation.

use std::path::Path;

use crate::error::FallbackError;
use crate::FallbackResult;

/// Playlist written when nothing else can be: a finished VOD playlist that
/// references no segment.
pub const TERMINAL_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:1\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-ENDLIST\n";

/// One playlist entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSegment {
    pub uri: String,
    pub duration: f64,
}

/// A single-rendition media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    pub segments: Vec<PlaylistSegment>,
    /// Finished playlists carry `#EXT-X-ENDLIST`.
    pub ended: bool,
}

impl MediaPlaylist {
    /// A finished playlist holding one segment.
    pub fn vod(uri: impl Into<String>, duration: f64) -> Self {
        Self {
            media_sequence: 0,
            segments: vec![PlaylistSegment {
                uri: uri.into(),
                duration,
            }],
            ended: true,
        }
    }

    /// Smallest integer not below any segment duration.
    pub fn target_duration(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.duration.ceil() as u64)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            "#EXTM3U".to_string(),
            "#EXT-X-VERSION:3".to_string(),
            format!("#EXT-X-TARGETDURATION:{}", self.target_duration()),
            format!("#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence),
        ];
        if self.ended {
            lines.push("#EXT-X-PLAYLIST-TYPE:VOD".to_string());
        }
        for segment in &self.segments {
            lines.push(format!("#EXTINF:{:.3},", segment.duration));
            lines.push(segment.uri.clone());
        }
        if self.ended {
            lines.push("#EXT-X-ENDLIST".to_string());
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// Segment URIs a playlist references, in order.
pub fn segment_uris(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

/// Check a playlist is well formed and that every segment it references
/// exists next to it in `dir`.
pub fn validate(text: &str, dir: &Path) -> FallbackResult<()> {
    if text.lines().next().map(str::trim) != Some("#EXTM3U") {
        return Err(FallbackError::InvalidPlaylist(
            "missing #EXTM3U header".to_string(),
        ));
    }
    if !text.lines().any(|l| l.starts_with("#EXT-X-TARGETDURATION:")) {
        return Err(FallbackError::InvalidPlaylist(
            "missing #EXT-X-TARGETDURATION".to_string(),
        ));
    }

    let mut expect_uri = false;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("#EXTINF:") {
            expect_uri = true;
        } else if !line.starts_with('#') {
            if !expect_uri {
                return Err(FallbackError::InvalidPlaylist(format!(
                    "segment {line} without #EXTINF"
                )));
            }
            if !dir.join(line).is_file() {
                return Err(FallbackError::InvalidPlaylist(format!(
                    "segment {line} does not exist"
                )));
            }
            expect_uri = false;
        }
    }
    if expect_uri {
        return Err(FallbackError::InvalidPlaylist(
            "#EXTINF without segment".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vod_playlist_render() {
        let playlist = MediaPlaylist::vod("fallback_idle.ts", 2.0);
        assert_eq!(
            playlist.render(),
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:2\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-PLAYLIST-TYPE:VOD\n\
             #EXTINF:2.000,\n\
             fallback_idle.ts\n\
             #EXT-X-ENDLIST\n"
        );
    }

    #[test]
    fn test_target_duration_rounds_up() {
        let playlist = MediaPlaylist::vod("a.ts", 2.4);
        assert_eq!(playlist.target_duration(), 3);
    }

    #[test]
    fn test_validate_requires_existing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let text = MediaPlaylist::vod("seg.ts", 1.0).render();

        assert!(matches!(
            validate(&text, dir.path()),
            Err(FallbackError::InvalidPlaylist(_))
        ));

        std::fs::write(dir.path().join("seg.ts"), b"x").unwrap();
        validate(&text, dir.path()).unwrap();
        assert_eq!(segment_uris(&text), vec!["seg.ts"]);
    }

    #[test]
    fn test_terminal_playlist_is_valid_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        validate(TERMINAL_PLAYLIST, dir.path()).unwrap();
        assert!(segment_uris(TERMINAL_PLAYLIST).is_empty());
        assert!(TERMINAL_PLAYLIST.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_validate_rejects_missing_header() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate("#EXT-X-ENDLIST\n", dir.path()).is_err());
    }
}
