//! Test doubles for the inference backend and the stream transducer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::ArrayView2;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use super::backend::{BackendError, BackendSession, InferenceBackend};
use super::config::RvcModelParams;
use super::model::RvcError;
use super::transform::{StreamTransducer, TransducerChild, TransducerProcess, TransformSpec};

/// Accepts any model whose bytes start with `ONNX`. Sessions return their
/// input halved, or fail every run when the model is `ONNXFAIL`.
#[derive(Default)]
pub struct FakeBackend {
    pub live_sessions: Arc<AtomicUsize>,
}

impl InferenceBackend for FakeBackend {
    fn create_session(
        &self,
        model: &[u8],
        _params: &RvcModelParams,
    ) -> Result<Box<dyn BackendSession>, BackendError> {
        if !model.starts_with(b"ONNX") {
            return Err(BackendError::InvalidModel("bad magic".to_string()));
        }
        self.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            fail: model.starts_with(b"ONNXFAIL"),
            live: Arc::clone(&self.live_sessions),
        }))
    }
}

struct FakeSession {
    fail: bool,
    live: Arc<AtomicUsize>,
}

impl BackendSession for FakeSession {
    fn run(&mut self, input: ArrayView2<'_, f32>) -> Result<Vec<f32>, BackendError> {
        if self.fail {
            return Err(BackendError::Run("backend exploded".to_string()));
        }
        Ok(input.iter().map(|s| s * 0.5).collect())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn write_model(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// How a [`LoopbackTransducer`] behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loopback {
    /// Copy stdin to stdout unchanged.
    Echo,
    /// Exit with an error before reading anything.
    Crash,
    /// Never produce output and never exit on its own.
    Hang,
}

/// In-process transducer built on `tokio::io::duplex`.
pub struct LoopbackTransducer {
    pub mode: Loopback,
    pub spawned: AtomicUsize,
}

impl LoopbackTransducer {
    pub fn new(mode: Loopback) -> Self {
        Self {
            mode,
            spawned: AtomicUsize::new(0),
        }
    }
}

impl StreamTransducer for LoopbackTransducer {
    fn spawn(&self, _spec: &TransformSpec) -> Result<TransducerChild, RvcError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (stdin, mut inner_in) = tokio::io::duplex(1024);
        let (mut inner_out, stdout) = tokio::io::duplex(1024);
        let mode = self.mode;

        let task = tokio::spawn(async move {
            match mode {
                Loopback::Echo => {
                    tokio::io::copy(&mut inner_in, &mut inner_out).await?;
                    inner_out.shutdown().await?;
                    Ok(())
                }
                Loopback::Crash => Err(RvcError::TransformProcess(
                    "loopback crashed".to_string(),
                )),
                Loopback::Hang => {
                    let _keep = (inner_in, inner_out);
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        });

        Ok(TransducerChild {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(TaskProcess { task: Some(task) }),
        })
    }
}

struct TaskProcess {
    task: Option<JoinHandle<Result<(), RvcError>>>,
}

#[async_trait]
impl TransducerProcess for TaskProcess {
    async fn wait(&mut self) -> Result<(), RvcError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| RvcError::TransformProcess(e.to_string()))?,
            None => Ok(()),
        }
    }

    async fn kill(&mut self) -> Result<(), RvcError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

/// Encode samples as f32le bytes.
pub fn f32le(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode f32le bytes.
pub fn from_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
