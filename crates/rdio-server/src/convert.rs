//! Audio transcoding before persistence

use async_trait::async_trait;
use rdio_core::{Call, ConversionMode, Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Rewrites a call's audio in place
#[async_trait]
pub trait AudioConverter: Send + Sync {
    /// Convert `call`'s audio according to `mode`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] on failure; the call is left untouched.
    async fn convert(&self, call: &mut Call, mode: ConversionMode) -> Result<()>;
}

/// Converter that keeps the original audio
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl AudioConverter for Passthrough {
    async fn convert(&self, _call: &mut Call, _mode: ConversionMode) -> Result<()> {
        Ok(())
    }
}

/// Converter piping audio through an external `ffmpeg` into AAC
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    binary: PathBuf,
}

impl FfmpegConverter {
    /// Converter running `binary`
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(mode: ConversionMode) -> Vec<&'static str> {
        let mut args = vec!["-hide_banner", "-loglevel", "error", "-i", "pipe:0"];
        if mode == ConversionMode::Normalized {
            args.extend(["-af", "loudnorm"]);
        }
        args.extend([
            "-c:a", "aac", "-b:a", "32k", "-movflags", "frag_keyframe+empty_moov", "-f", "ipod",
            "pipe:1",
        ]);
        args
    }
}

/// Replace the extension of `name` with `.m4a`
fn m4a_name(name: &str) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    format!("{stem}.m4a")
}

#[async_trait]
impl AudioConverter for FfmpegConverter {
    async fn convert(&self, call: &mut Call, mode: ConversionMode) -> Result<()> {
        if mode == ConversionMode::Disabled {
            return Ok(());
        }

        let mut child = Command::new(&self.binary)
            .args(Self::args(mode))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Conversion(format!("spawn {}: {e}", self.binary.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Conversion("ffmpeg stdin unavailable".to_string()))?;
        let input = call.audio.clone();
        let writer = tokio::spawn(async move {
            let written = stdin.write_all(&input).await;
            drop(stdin);
            written
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Conversion(e.to_string()))?;
        writer
            .await
            .map_err(|e| Error::Conversion(e.to_string()))?
            .map_err(|e| Error::Conversion(format!("write ffmpeg input: {e}")))?;

        if !output.status.success() {
            return Err(Error::Conversion(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::Conversion("ffmpeg produced no audio".to_string()));
        }

        debug!(
            file = %call.audio_name,
            before = call.audio.len(),
            after = output.stdout.len(),
            "Audio converted"
        );
        call.audio = output.stdout;
        call.audio_name = m4a_name(&call.audio_name);
        call.audio_mime = "audio/mp4".to_string();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_m4a_name() {
        assert_eq!(m4a_name("call.wav"), "call.m4a");
        assert_eq!(m4a_name("a.b.mp3"), "a.b.m4a");
        assert_eq!(m4a_name("noext"), "noext.m4a");
    }

    #[test]
    fn test_normalized_adds_loudnorm() {
        assert!(FfmpegConverter::args(ConversionMode::Normalized).contains(&"loudnorm"));
        assert!(!FfmpegConverter::args(ConversionMode::Enabled).contains(&"loudnorm"));
    }

    #[tokio::test]
    async fn test_missing_binary_leaves_call_untouched() {
        let converter = FfmpegConverter::new("/nonexistent/ffmpeg");
        let mut call = Call {
            audio: vec![1; 64],
            audio_name: "call.wav".to_string(),
            audio_mime: "audio/wav".to_string(),
            ..Call::default()
        };

        let err = converter
            .convert(&mut call, ConversionMode::Enabled)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conversion(_)));
        assert_eq!(call.audio_name, "call.wav");
        assert_eq!(call.audio.len(), 64);
    }

    #[tokio::test]
    async fn test_disabled_mode_is_noop() {
        let converter = FfmpegConverter::new("/nonexistent/ffmpeg");
        let mut call = Call::default();

        converter
            .convert(&mut call, ConversionMode::Disabled)
            .await
            .unwrap();
        Passthrough
            .convert(&mut call, ConversionMode::Normalized)
            .await
            .unwrap();
    }
}
