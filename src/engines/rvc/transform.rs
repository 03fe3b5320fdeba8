//! Pitch shift and resampling of a continuous sample stream.
//!
//! The pitch is shifted with the resample-then-retime technique: the stream
//! is relabelled at `input_rate * pitch_factor` (raising pitch and speed
//! together), resampled to the target rate, then time-stretched by
//! `1 / pitch_factor` so playback duration is unchanged.
//!
//! The work itself is done by a [`StreamTransducer`]. [`FfmpegTransducer`]
//! runs `ffmpeg` as a long-lived child process with piped stdin/stdout.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::model::RvcError;

/// Longest stderr excerpt kept for error messages.
const STDERR_LIMIT: usize = 4096;

/// Frequency ratio for a shift of `semitones`: `2^(semitones / 12)`.
pub fn pitch_factor(semitones: i32) -> f64 {
    2f64.powf(semitones as f64 / 12.0)
}

/// Declarative description of one stream transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformSpec {
    /// Rate of the f32le mono samples written to the transducer.
    pub input_sample_rate: u32,
    /// Rate of the f32le mono samples read back from it.
    pub sample_rate: u32,
    pub pitch_factor: f64,
}

impl TransformSpec {
    pub fn new(input_sample_rate: u32, sample_rate: u32, pitch_semitones: i32) -> Self {
        Self {
            input_sample_rate,
            sample_rate,
            pitch_factor: pitch_factor(pitch_semitones),
        }
    }

    /// Rate the input is relabelled at before resampling.
    pub fn shifted_rate(&self) -> u32 {
        (self.input_sample_rate as f64 * self.pitch_factor).round() as u32
    }

    /// Time-stretch applied after resampling to restore the duration.
    pub fn tempo(&self) -> f64 {
        1.0 / self.pitch_factor
    }

    /// ffmpeg `-af` filter graph for this transform.
    pub fn filter_graph(&self) -> String {
        format!(
            "asetrate={},aresample={}:async=1000,atempo={:.6}",
            self.shifted_rate(),
            self.sample_rate,
            self.tempo()
        )
    }

    /// Full ffmpeg argument list: raw f32le mono in on stdin, raw f32le mono
    /// out on stdout.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "f32le".into(),
            "-ar".into(),
            self.input_sample_rate.to_string(),
            "-ac".into(),
            "1".into(),
            "-i".into(),
            "pipe:0".into(),
            "-af".into(),
            self.filter_graph(),
            "-f".into(),
            "f32le".into(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            "1".into(),
            "pipe:1".into(),
        ]
    }
}

/// Control half of a running transducer.
#[async_trait]
pub trait TransducerProcess: Send {
    /// Wait for the transducer to finish. An abnormal exit is an error.
    async fn wait(&mut self) -> Result<(), RvcError>;

    /// Force-terminate the transducer and reap it.
    async fn kill(&mut self) -> Result<(), RvcError>;
}

/// A started transducer: write samples to `stdin`, read them back from
/// `stdout`. Dropping `stdin` signals end of input.
pub struct TransducerChild {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn TransducerProcess>,
}

/// Starts stream transforms. Implementations may run out of process (ffmpeg)
/// or in process.
pub trait StreamTransducer: Send + Sync {
    fn spawn(&self, spec: &TransformSpec) -> Result<TransducerChild, RvcError>;
}

/// Runs the transform through an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct FfmpegTransducer {
    program: PathBuf,
}

impl Default for FfmpegTransducer {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegTransducer {
    /// Use `ffmpeg` from PATH.
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }

    /// Use an explicit ffmpeg binary, e.g. one bundled with the application.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl StreamTransducer for FfmpegTransducer {
    fn spawn(&self, spec: &TransformSpec) -> Result<TransducerChild, RvcError> {
        log::debug!("Spawning {} -af {}", self.program.display(), spec.filter_graph());

        let mut child = Command::new(&self.program)
            .args(spec.ffmpeg_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RvcError::FfmpegNotFound
                } else {
                    RvcError::Io(e)
                }
            })?;

        let missing = |name: &str| RvcError::TransformProcess(format!("ffmpeg {name} not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = (&mut stderr)
                    .take(STDERR_LIMIT as u64)
                    .read_to_end(&mut buf)
                    .await;
                // Keep draining so ffmpeg never blocks on a full pipe.
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        Ok(TransducerChild {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(FfmpegProcess { child, stderr }),
        })
    }
}

struct FfmpegProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    async fn stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl TransducerProcess for FfmpegProcess {
    async fn wait(&mut self) -> Result<(), RvcError> {
        let status = self.child.wait().await?;
        let stderr = self.stderr().await;
        if !status.success() {
            return Err(RvcError::TransformProcess(format!(
                "ffmpeg exited with code {:?}: {}",
                status.code(),
                stderr.trim()
            )));
        }
        log::debug!("ffmpeg exited cleanly");
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), RvcError> {
        self.child.kill().await?;
        log::debug!("ffmpeg killed");
        Ok(())
    }
}
