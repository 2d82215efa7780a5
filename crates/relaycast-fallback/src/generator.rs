//! Fallback content generator.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use relaycast_ipc::{DegradedReason, FallbackKind, FallbackTier, OutputTarget};

use crate::error::FallbackError;
use crate::playlist::{self, MediaPlaylist, TERMINAL_PLAYLIST};
use crate::segment::synthesize_segment;
use crate::FallbackResult;

/// Fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Pre-rendered segment shown while idle.
    pub idle_slate: Option<PathBuf>,

    /// Pre-rendered segment shown while degraded.
    pub degraded_slate: Option<PathBuf>,

    /// Duration advertised for slate segments.
    pub slate_duration_secs: f64,

    /// Duration advertised for synthesized segments.
    pub synthesized_duration_secs: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            idle_slate: None,
            degraded_slate: None,
            slate_duration_secs: 4.0,
            synthesized_duration_secs: 1.0,
        }
    }
}

/// Contents of the status sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFile {
    pub state: String,
    pub message: String,
    pub updated_at_unix: u64,
}

/// Writes valid fallback content when the transcoder is not running.
///
/// Callers must stop the transcoder before calling in here; the generator
/// assumes it is the only writer of the output directory.
#[derive(Debug, Clone)]
pub struct FallbackGenerator {
    output: OutputTarget,
    config: FallbackConfig,
}

impl FallbackGenerator {
    pub fn new(output: OutputTarget, config: FallbackConfig) -> Self {
        Self { output, config }
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    /// Show idle content.
    pub fn show_idle(&self) -> FallbackTier {
        self.show(FallbackKind::Idle, "Waiting for broadcasters")
    }

    /// Show degraded content with the reason in the status sidecar.
    pub fn show_degraded(&self, reason: &DegradedReason) -> FallbackTier {
        self.show(FallbackKind::Degraded, &reason.message())
    }

    /// Publish fallback content for `kind`. Never fails: each tier falls
    /// through to the next, ending in the hard-coded playlist.
    #[instrument(name = "fallback_show", skip(self, message), fields(kind = kind.name()))]
    fn show(&self, kind: FallbackKind, message: &str) -> FallbackTier {
        let tier = match self.publish(kind) {
            Ok(tier) => tier,
            Err(e) => {
                warn!("Fallback publish failed, writing terminal playlist: {}", e);
                match self.write_terminal() {
                    Ok(()) => FallbackTier::Terminal,
                    Err(e) => {
                        error!("Terminal playlist write failed: {}", e);
                        return FallbackTier::Failed;
                    }
                }
            }
        };

        if let Err(e) = self.write_status(kind.name(), message) {
            warn!("Status sidecar not written: {}", e);
        }
        info!(tier = ?tier, "Fallback content published");
        tier
    }

    fn publish(&self, kind: FallbackKind) -> FallbackResult<FallbackTier> {
        fs::create_dir_all(&self.output.dir)?;

        let segment_name = self.output.fallback_segment_name(kind.name());
        let segment_path = self.output.dir.join(&segment_name);

        let (tier, duration) = match self.slate_for(kind) {
            Some(slate) => match self.copy_slate(slate, &segment_path) {
                Ok(()) => (FallbackTier::Slate, self.config.slate_duration_secs),
                Err(e) => {
                    warn!("{}, synthesizing segment instead", e);
                    self.write_synthesized(&segment_path)?;
                    (FallbackTier::Synthesized, self.config.synthesized_duration_secs)
                }
            },
            None => {
                self.write_synthesized(&segment_path)?;
                (FallbackTier::Synthesized, self.config.synthesized_duration_secs)
            }
        };

        let text = MediaPlaylist::vod(segment_name, duration).render();
        playlist::validate(&text, &self.output.dir)?;
        write_atomic(&self.output.playlist_path(), text.as_bytes())?;

        // The playlist no longer references transcoder output.
        self.prune_live_segments();
        Ok(tier)
    }

    fn slate_for(&self, kind: FallbackKind) -> Option<&Path> {
        match kind {
            FallbackKind::Idle => self.config.idle_slate.as_deref(),
            FallbackKind::Degraded => self
                .config
                .degraded_slate
                .as_deref()
                .or(self.config.idle_slate.as_deref()),
        }
    }

    fn copy_slate(&self, slate: &Path, target: &Path) -> FallbackResult<()> {
        let bytes = fs::read(slate).map_err(|source| FallbackError::SlateUnavailable {
            path: slate.to_path_buf(),
            source,
        })?;
        write_atomic(target, &bytes)
    }

    fn write_synthesized(&self, target: &Path) -> FallbackResult<()> {
        write_atomic(target, &synthesize_segment())
    }

    /// Last resort: a direct write of a playlist that references nothing.
    fn write_terminal(&self) -> std::io::Result<()> {
        // Best effort; the write below reports the real failure.
        let _ = fs::create_dir_all(&self.output.dir);
        fs::write(self.output.playlist_path(), TERMINAL_PLAYLIST)
    }

    fn write_status(&self, state: &str, message: &str) -> FallbackResult<()> {
        let status = StatusFile {
            state: state.to_string(),
            message: message.to_string(),
            updated_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let json = serde_json::to_vec_pretty(&status)?;
        write_atomic(&self.output.status_path(), &json)
    }

    /// Remove segments written by any transcoder generation.
    pub fn prune_live_segments(&self) -> usize {
        self.remove_matching(|name| {
            name.starts_with(&self.output.live_segment_prefix) && name.ends_with(".ts")
        })
    }

    /// Remove live segments of every generation except `current`.
    pub fn prune_stale_generations(&self, current: u64) -> usize {
        let prefix = format!("{}g", self.output.live_segment_prefix);
        self.remove_matching(|name| {
            let Some(generation) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split_once('_'))
                .and_then(|(generation, _)| generation.parse::<u64>().ok())
            else {
                return false;
            };
            generation != current && name.ends_with(".ts")
        })
    }

    /// Remove everything the relay writes into the output directory.
    #[instrument(name = "fallback_clear", skip(self))]
    pub fn clear_output(&self) -> FallbackResult<usize> {
        if !self.output.dir.exists() {
            return Ok(0);
        }
        let removed = self.remove_matching(|name| {
            name == self.output.playlist_name
                || name == self.output.status_name
                || name.ends_with(".tmp")
                || (name.ends_with(".ts")
                    && (name.starts_with(&self.output.live_segment_prefix)
                        || name.starts_with(&self.output.fallback_segment_prefix)))
        });
        info!(removed, "Output cleared");
        Ok(removed)
    }

    fn remove_matching(&self, matches: impl Fn(&str) -> bool) -> usize {
        let entries = match fs::read_dir(&self.output.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Output directory not readable: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !matches(name) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = name, "Could not remove output file: {}", e),
            }
        }
        removed
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(target: &Path, bytes: &[u8]) -> FallbackResult<()> {
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::{segment_uris, validate};
    use crate::segment::TS_PACKET_SIZE;

    fn generator(dir: &Path) -> FallbackGenerator {
        FallbackGenerator::new(OutputTarget::new(dir), FallbackConfig::default())
    }

    fn read_playlist(dir: &Path) -> String {
        fs::read_to_string(dir.join("index.m3u8")).unwrap()
    }

    #[test]
    fn test_idle_playlist_references_existing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let tier = generator(dir.path()).show_idle();

        assert_eq!(tier, FallbackTier::Synthesized);
        let text = read_playlist(dir.path());
        assert!(text.contains("#EXT-X-ENDLIST"));
        assert_eq!(segment_uris(&text), vec!["fallback_idle.ts"]);
        validate(&text, dir.path()).unwrap();

        let segment = fs::read(dir.path().join("fallback_idle.ts")).unwrap();
        assert_eq!(segment.len() % TS_PACKET_SIZE, 0);
        assert!(!dir.path().join("index.m3u8.tmp").exists());
    }

    #[test]
    fn test_degraded_writes_status_message() {
        let dir = tempfile::tempdir().unwrap();
        let reason = DegradedReason::AbnormalExit {
            code: Some(1),
            signal: None,
        };
        generator(dir.path()).show_degraded(&reason);

        let status: StatusFile =
            serde_json::from_slice(&fs::read(dir.path().join("status.json")).unwrap()).unwrap();
        assert_eq!(status.state, "degraded");
        assert_eq!(status.message, reason.message());
        assert_eq!(
            segment_uris(&read_playlist(dir.path())),
            vec!["fallback_degraded.ts"]
        );
    }

    #[test]
    fn test_slate_is_preferred_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let slate = dir.path().join("slate.ts");
        fs::write(&slate, vec![0x47u8; TS_PACKET_SIZE]).unwrap();
        let output = dir.path().join("hls");

        let generator = FallbackGenerator::new(
            OutputTarget::new(&output),
            FallbackConfig {
                idle_slate: Some(slate),
                ..Default::default()
            },
        );

        assert_eq!(generator.show_idle(), FallbackTier::Slate);
        // Degraded falls back to the idle slate.
        assert_eq!(
            generator.show_degraded(&DegradedReason::OutputCleared),
            FallbackTier::Slate
        );
        assert_eq!(
            fs::read(output.join("fallback_idle.ts")).unwrap().len(),
            TS_PACKET_SIZE
        );
    }

    #[test]
    fn test_missing_slate_falls_back_to_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let generator = FallbackGenerator::new(
            OutputTarget::new(dir.path()),
            FallbackConfig {
                idle_slate: Some(dir.path().join("missing.ts")),
                ..Default::default()
            },
        );

        assert_eq!(generator.show_idle(), FallbackTier::Synthesized);
        validate(&read_playlist(dir.path()), dir.path()).unwrap();
    }

    #[test]
    fn test_segment_write_failure_falls_back_to_terminal_playlist() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the segment should go makes the segment write fail.
        fs::create_dir(dir.path().join("fallback_idle.ts.tmp")).unwrap();

        let tier = generator(dir.path()).show_idle();

        assert_eq!(tier, FallbackTier::Terminal);
        let text = read_playlist(dir.path());
        assert_eq!(text, TERMINAL_PLAYLIST);
        validate(&text, dir.path()).unwrap();
    }

    #[test]
    fn test_unwritable_output_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        // The output "directory" is a regular file.
        let blocker = dir.path().join("hls");
        fs::write(&blocker, b"").unwrap();

        assert_eq!(generator(&blocker).show_idle(), FallbackTier::Failed);
    }

    #[test]
    fn test_publish_prunes_live_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("live_g1_00001.ts"), b"x").unwrap();
        fs::write(dir.path().join("live_g2_00001.ts"), b"x").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        generator(dir.path()).show_idle();

        assert!(!dir.path().join("live_g1_00001.ts").exists());
        assert!(!dir.path().join("live_g2_00001.ts").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_prune_stale_generations_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "live_g1_00041.ts",
            "live_g2_00003.ts",
            "live_g3_00000.ts",
            "live_g3_00001.ts",
            "fallback_idle.ts",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let removed = generator(dir.path()).prune_stale_generations(3);

        assert_eq!(removed, 2);
        assert!(!dir.path().join("live_g1_00041.ts").exists());
        assert!(!dir.path().join("live_g2_00003.ts").exists());
        assert!(dir.path().join("live_g3_00000.ts").exists());
        assert!(dir.path().join("live_g3_00001.ts").exists());
        assert!(dir.path().join("fallback_idle.ts").exists());
    }

    #[test]
    fn test_clear_output_removes_relay_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        generator.show_idle();
        fs::write(dir.path().join("live_g3_00000.ts"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        let removed = generator.clear_output().unwrap();

        assert_eq!(removed, 4);
        assert!(!dir.path().join("index.m3u8").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_clear_missing_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir.path().join("absent"));
        assert_eq!(generator.clear_output().unwrap(), 0);
    }
}
