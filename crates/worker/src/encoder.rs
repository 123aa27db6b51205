//! Frame sequence to looped video, through an external ffmpeg process

use async_trait::async_trait;
use genloop_common::{GenLoopError, Result};
use image::RgbImage;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait FrameEncoder: Send + Sync {
    /// Encode `frames` at `fps` and loop the clip to `duration_minutes`.
    /// Returns the path of the finished video.
    async fn create_looped_video(
        &self,
        frames: Vec<RgbImage>,
        fps: u32,
        duration_minutes: f32,
        job_id: &str,
    ) -> Result<PathBuf>;
}

pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    temp_dir: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            output_dir: output_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    async fn encode_frames(&self, frames: Vec<RgbImage>, fps: u32, work_dir: &Path, output: &Path) -> Result<()> {
        tokio::fs::create_dir_all(work_dir).await?;

        let dir = work_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for (i, frame) in frames.iter().enumerate() {
                let path = dir.join(format!("frame_{:06}.png", i));
                frame
                    .save_with_format(&path, image::ImageFormat::Png)
                    .map_err(|e| GenLoopError::encoding(format!("failed to write frame {}: {}", i, e)))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| GenLoopError::internal(format!("frame writer task failed: {}", e)))??;

        let pattern = work_dir.join("frame_%06d.png");
        let fps = fps.to_string();
        self.run_ffmpeg(vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-framerate".into(),
            fps.into(),
            "-i".into(),
            pattern.as_os_str().to_owned(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-crf".into(),
            "18".into(),
            "-movflags".into(),
            "+faststart".into(),
            output.as_os_str().to_owned(),
        ])
        .await
    }

    async fn loop_video(&self, input: &Path, output: &Path, duration_minutes: f32) -> Result<()> {
        // ffmpeg gets whole seconds
        let seconds = ((duration_minutes * 60.0) as u64).to_string();
        self.run_ffmpeg(vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-stream_loop".into(),
            "-1".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-t".into(),
            seconds.into(),
            "-c".into(),
            "copy".into(),
            output.as_os_str().to_owned(),
        ])
        .await
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<()> {
        debug!("Running {} {:?}", self.ffmpeg.display(), args);

        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GenLoopError::encoding(format!("FFmpeg failed: {}", e)))?;

        if !output.status.success() {
            return Err(GenLoopError::encoding(format!(
                "FFmpeg failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameEncoder for FfmpegEncoder {
    async fn create_looped_video(
        &self,
        frames: Vec<RgbImage>,
        fps: u32,
        duration_minutes: f32,
        job_id: &str,
    ) -> Result<PathBuf> {
        if frames.is_empty() {
            return Err(GenLoopError::encoding("no frames to encode"));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let work_dir = self.temp_dir.join(format!("frames_{}", job_id));
        let temp_path = self.temp_dir.join(format!("temp_{}.mp4", job_id));
        let final_path = self.output_dir.join(format!("{}.mp4", job_id));
        let frame_count = frames.len();

        let encoded = self.encode_frames(frames, fps, &work_dir, &temp_path).await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!("Failed to remove {}: {}", work_dir.display(), e);
        }

        let looped = match encoded {
            Ok(()) => self.loop_video(&temp_path, &final_path, duration_minutes).await,
            Err(e) => Err(e),
        };
        if tokio::fs::try_exists(&temp_path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                warn!("Failed to remove {}: {}", temp_path.display(), e);
            }
        }
        looped?;

        info!(
            job_id = %job_id,
            frames = frame_count,
            fps,
            duration_minutes,
            "Encoded looped video at {}",
            final_path.display()
        );
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_binary_is_encoding_error_and_cleans_scratch() {
        let dir = TempDir::new().unwrap();
        let encoder = FfmpegEncoder::new(
            dir.path().join("no-such-ffmpeg"),
            dir.path().join("out"),
            dir.path().join("tmp"),
        );
        let frames = vec![RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])); 3];

        let err = encoder
            .create_looped_video(frames, 24, 1.0, "job1")
            .await
            .unwrap_err();

        assert!(matches!(err, GenLoopError::Encoding(_)));
        assert!(err.to_string().contains("FFmpeg failed"));
        assert!(!dir.path().join("tmp").join("frames_job1").exists());
        assert!(!dir.path().join("tmp").join("temp_job1.mp4").exists());
    }

    #[tokio::test]
    async fn test_empty_frames_rejected() {
        let dir = TempDir::new().unwrap();
        let encoder = FfmpegEncoder::new("ffmpeg", dir.path(), dir.path());

        let err = encoder
            .create_looped_video(Vec::new(), 24, 1.0, "job2")
            .await
            .unwrap_err();

        assert!(matches!(err, GenLoopError::Encoding(_)));
    }
}
