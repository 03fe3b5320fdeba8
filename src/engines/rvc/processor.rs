use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::backend::InferenceBackend;
use super::config::{
    validate_buffer_size, validate_pitch, validate_resample_rate, ProcessorConfig, RvcModelParams,
};
use super::model::{RvcError, RvcSession, SessionState};
use super::normalize::normalize_in_place;
use super::transform::{StreamTransducer, TransducerChild, TransformSpec};
use crate::AudioClip;

/// Bytes copied per read from the transducer's output.
const DRAIN_BUFFER_BYTES: usize = 16 * 1024;

/// Cumulative counters for one processor. Reset by
/// [`RvcProcessor::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessingStats {
    pub input_sample_count: u64,
    pub output_sample_count: u64,
    pub processing_time_ms: f64,
}

/// Notifications emitted by an [`RvcProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    ModelLoaded,
    ProcessingStart,
    Error(String),
    /// Emitted exactly once per [`RvcProcessor::process_stream`] call.
    ProcessingComplete(ProcessingStats),
}

#[derive(Clone, Default)]
struct Listeners(Arc<Mutex<Vec<mpsc::UnboundedSender<ProcessorEvent>>>>);

impl Listeners {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().push(tx);
        rx
    }

    fn emit(&self, event: ProcessorEvent) {
        self.0.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn error(&self, error: &RvcError) {
        log::error!("{error}");
        self.emit(ProcessorEvent::Error(error.to_string()));
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

struct StreamTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<ProcessingStats>,
}

/// Drives audio through one voice model.
///
/// Two independent paths are offered: [`run_one_frame`](Self::run_one_frame)
/// pushes a single frame through the neural session, and
/// [`process_stream`](Self::process_stream) pipes a continuous f32le stream
/// through normalization and the pitch/resample transducer.
///
/// Call [`cleanup`](Self::cleanup) last, before dropping the processor.
pub struct RvcProcessor {
    config: ProcessorConfig,
    session: RvcSession,
    transducer: Arc<dyn StreamTransducer>,
    stats: Arc<Mutex<ProcessingStats>>,
    listeners: Listeners,
    stream: Option<StreamTask>,
}

impl RvcProcessor {
    /// Validate `config` and create an unloaded processor.
    pub fn new(
        config: ProcessorConfig,
        backend: Arc<dyn InferenceBackend>,
        transducer: Arc<dyn StreamTransducer>,
    ) -> Result<Self, RvcError> {
        Self::with_params(config, RvcModelParams::default(), backend, transducer)
    }

    pub fn with_params(
        config: ProcessorConfig,
        params: RvcModelParams,
        backend: Arc<dyn InferenceBackend>,
        transducer: Arc<dyn StreamTransducer>,
    ) -> Result<Self, RvcError> {
        config.validate()?;
        Ok(Self {
            config,
            session: RvcSession::new(backend, params),
            transducer,
            stats: Arc::default(),
            listeners: Listeners::default(),
            stream: None,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_ready()
    }

    /// Register for events. Dropped receivers are pruned on the next emit.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessorEvent> {
        self.listeners.subscribe()
    }

    /// Load the configured model.
    pub async fn load(&mut self) -> Result<(), RvcError> {
        match self.session.load(&self.config.model_path).await {
            Ok(()) => {
                self.listeners.emit(ProcessorEvent::ModelLoaded);
                Ok(())
            }
            Err(e) => {
                self.listeners.error(&e);
                Err(e)
            }
        }
    }

    /// Release the inference session. No-op when nothing is loaded.
    pub fn unload(&mut self) {
        self.session.unload();
    }

    /// Normalize `frame`, run it through the model and return its output.
    ///
    /// Fails with [`RvcError::SessionNotReady`] before [`load`](Self::load),
    /// leaving the stats untouched.
    pub fn run_one_frame(&mut self, frame: &[f32]) -> Result<Vec<f32>, RvcError> {
        let start = Instant::now();
        let output = match self.session.run(frame) {
            Ok(output) => output,
            Err(e) => {
                if matches!(e, RvcError::Inference(_)) {
                    self.listeners.error(&e);
                }
                return Err(e);
            }
        };

        let mut stats = self.stats.lock();
        stats.input_sample_count += frame.len() as u64;
        stats.output_sample_count += output.len() as u64;
        stats.processing_time_ms += start.elapsed().as_secs_f64() * 1000.0;
        Ok(output)
    }

    /// Convert a whole clip, one `buffer_size_frames` frame at a time.
    pub fn convert_clip(&mut self, clip: &AudioClip) -> Result<AudioClip, RvcError> {
        if clip.samples.is_empty() {
            return Err(RvcError::EmptyInput);
        }

        let mut samples = Vec::with_capacity(clip.samples.len());
        for frame in clip.samples.chunks(self.config.buffer_size_frames) {
            samples.extend(self.run_one_frame(frame)?);
        }

        // The model may emit more or fewer samples than it was fed; keep the
        // clip's duration by scaling the rate.
        let ratio = samples.len() as f64 / clip.samples.len() as f64;
        let sample_rate = (clip.sample_rate as f64 * ratio).round().max(1.0) as u32;
        Ok(AudioClip {
            samples,
            sample_rate,
        })
    }

    /// Change the pitch used by the next stream. Does not touch the session.
    pub fn set_pitch(&mut self, semitones: i32) -> Result<(), RvcError> {
        validate_pitch(semitones)?;
        self.config.pitch_semitones = semitones;
        Ok(())
    }

    /// Change the output rate used by the next stream. Does not touch the
    /// session.
    pub fn set_resample_rate(&mut self, rate_hz: u32) -> Result<(), RvcError> {
        validate_resample_rate(rate_hz)?;
        self.config.resample_rate_hz = rate_hz;
        Ok(())
    }

    pub fn set_buffer_size(&mut self, frames: usize) -> Result<(), RvcError> {
        validate_buffer_size(frames)?;
        self.config.buffer_size_frames = frames;
        Ok(())
    }

    pub fn transform_spec(&self) -> TransformSpec {
        TransformSpec::new(
            self.config.input_sample_rate_hz,
            self.config.resample_rate_hz,
            self.config.pitch_semitones,
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Start piping `input` (raw f32le mono at `input_sample_rate_hz`)
    /// through normalization and the pitch/resample transducer into `output`.
    ///
    /// Returns once the pipeline is running; it proceeds on a Tokio task.
    /// Emits `ProcessingStart`, then any errors, then exactly one
    /// `ProcessingComplete`, including when the transducer fails to start.
    /// Await the end with [`join_stream`](Self::join_stream).
    pub fn process_stream<R, W>(&mut self, input: R, output: W) -> Result<(), RvcError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_streaming() {
            return Err(RvcError::StreamActive);
        }
        self.stream = None;

        let spec = self.transform_spec();
        log::info!(
            "Starting stream: {} Hz -> {} Hz, pitch x{:.3}",
            spec.input_sample_rate,
            spec.sample_rate,
            spec.pitch_factor
        );
        self.listeners.emit(ProcessorEvent::ProcessingStart);

        let child = match self.transducer.spawn(&spec) {
            Ok(child) => child,
            Err(e) => {
                self.listeners.error(&e);
                self.listeners
                    .emit(ProcessorEvent::ProcessingComplete(self.get_stats()));
                return Err(e);
            }
        };

        let (stop, stop_rx) = oneshot::channel();
        let job = StreamJob {
            chunk_frames: self.config.buffer_size_frames,
            stats: Arc::clone(&self.stats),
            listeners: self.listeners.clone(),
        };
        let handle = tokio::spawn(job.run(input, output, child, stop_rx));
        self.stream = Some(StreamTask { stop, handle });
        Ok(())
    }

    /// Wait for the active stream to finish and return the stats at that
    /// point. `None` when no stream was started.
    pub async fn join_stream(&mut self) -> Option<ProcessingStats> {
        let StreamTask { stop, handle } = self.stream.take()?;
        let result = handle.await;
        drop(stop);
        match result {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::error!("Stream task failed: {e}");
                let stats = self.get_stats();
                self.listeners.emit(ProcessorEvent::ProcessingComplete(stats));
                Some(stats)
            }
        }
    }

    /// Snapshot of the counters.
    pub fn get_stats(&self) -> ProcessingStats {
        *self.stats.lock()
    }

    /// Terminate any active stream, unload the session, drop every
    /// subscriber and zero the stats. Safe to call repeatedly.
    pub async fn cleanup(&mut self) {
        if let Some(StreamTask { stop, handle }) = self.stream.take() {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                log::error!("Stream task failed: {e}");
                self.listeners
                    .emit(ProcessorEvent::ProcessingComplete(self.get_stats()));
            }
        }
        self.session.unload();
        self.listeners.clear();
        *self.stats.lock() = ProcessingStats::default();
        log::debug!("Processor for {} cleaned up", self.config.model_path.display());
    }
}

struct StreamJob {
    chunk_frames: usize,
    stats: Arc<Mutex<ProcessingStats>>,
    listeners: Listeners,
}

impl StreamJob {
    async fn run<R, W>(
        self,
        input: R,
        output: W,
        child: TransducerChild,
        mut stop: oneshot::Receiver<()>,
    ) -> ProcessingStats
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let TransducerChild {
            stdin,
            stdout,
            mut process,
        } = child;

        // The stream ends when the transducer's output closes. A feed still
        // blocked on an idle input is dropped at that point.
        let pipeline = async {
            let feeding = feed(input, stdin, self.chunk_frames, &self.stats);
            let draining = drain(stdout, output, &self.stats);
            tokio::pin!(feeding, draining);

            let mut fed = None;
            let drained = loop {
                tokio::select! {
                    result = &mut feeding, if fed.is_none() => fed = Some(result),
                    result = &mut draining => break result,
                }
            };
            if fed.is_none() {
                log::debug!("Transducer output closed before input ended");
            }
            (fed.unwrap_or(Ok(())), drained)
        };

        tokio::select! {
            (fed, drained) = pipeline => {
                for result in [fed, drained] {
                    if let Err(e) = result {
                        self.listeners.error(&e);
                    }
                }
                if let Err(e) = process.wait().await {
                    self.listeners.error(&e);
                }
            }
            _ = &mut stop => {
                log::info!("Stream stopped, terminating transducer");
                if let Err(e) = process.kill().await {
                    self.listeners.error(&e);
                }
            }
        }

        let stats = {
            let mut stats = self.stats.lock();
            stats.processing_time_ms += started.elapsed().as_secs_f64() * 1000.0;
            *stats
        };
        log::info!(
            "Stream complete: {} samples in, {} samples out",
            stats.input_sample_count,
            stats.output_sample_count
        );
        self.listeners
            .emit(ProcessorEvent::ProcessingComplete(stats));
        stats
    }
}

/// Read `chunk_frames` samples at a time, normalize each chunk and write it
/// to the transducer. Closing the transducer's stdin marks end of input.
async fn feed<R>(
    mut input: R,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    chunk_frames: usize,
    stats: &Mutex<ProcessingStats>,
) -> Result<(), RvcError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = vec![0u8; chunk_frames * 4];
    let mut samples = Vec::with_capacity(chunk_frames);
    let mut encoded = Vec::with_capacity(chunk_frames * 4);

    loop {
        let filled = read_full(&mut input, &mut raw).await?;
        let partial = filled % 4;
        if partial != 0 {
            log::warn!("Dropping {partial} trailing bytes of an incomplete sample");
        }

        let whole = filled - partial;
        if whole > 0 {
            samples.clear();
            samples.extend(
                raw[..whole]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
            normalize_in_place(&mut samples)?;

            encoded.clear();
            for sample in &samples {
                encoded.extend_from_slice(&sample.to_le_bytes());
            }
            stdin.write_all(&encoded).await.map_err(|e| {
                RvcError::TransformProcess(format!("transducer stopped accepting input: {e}"))
            })?;
            stats.lock().input_sample_count += samples.len() as u64;
        }

        if filled < raw.len() {
            break;
        }
    }

    stdin.shutdown().await?;
    Ok(())
}

/// Copy the transducer's output to `output`, counting whole samples.
async fn drain<W>(
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    mut output: W,
    stats: &Mutex<ProcessingStats>,
) -> Result<(), RvcError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DRAIN_BUFFER_BYTES];
    let mut total_bytes: u64 = 0;

    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;

        let before = total_bytes / 4;
        total_bytes += n as u64;
        stats.lock().output_sample_count += total_bytes / 4 - before;
    }

    output.shutdown().await?;
    Ok(())
}

/// Fill `buf` unless the reader hits EOF first. Returns the bytes read.
async fn read_full<R>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{ProcessingStats, ProcessorEvent, RvcProcessor};
    use crate::engines::rvc::config::ProcessorConfig;
    use crate::engines::rvc::model::{RvcError, SessionState};
    use crate::engines::rvc::testing::{
        f32le, from_f32le, write_model, FakeBackend, Loopback, LoopbackTransducer,
    };
    use crate::AudioClip;

    fn processor(
        dir: &std::path::Path,
        model: &[u8],
        mode: Loopback,
    ) -> (RvcProcessor, Arc<FakeBackend>, Arc<LoopbackTransducer>) {
        let path = write_model(dir, "voice.onnx", model);
        let backend = Arc::new(FakeBackend::default());
        let transducer = Arc::new(LoopbackTransducer::new(mode));
        let config = ProcessorConfig::builder()
            .model_path(path)
            .buffer_size_frames(256)
            .build()
            .unwrap();
        let processor =
            RvcProcessor::new(config, backend.clone(), transducer.clone()).unwrap();
        (processor, backend, transducer)
    }

    fn collect(rx: &mut UnboundedReceiver<ProcessorEvent>) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn completions(events: &[ProcessorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ProcessorEvent::ProcessingComplete(_)))
            .count()
    }

    #[test]
    fn invalid_config_fails_before_anything_is_acquired() {
        let transducer = Arc::new(LoopbackTransducer::new(Loopback::Echo));
        let mut config = ProcessorConfig::new("voice.onnx");
        config.pitch_semitones = 20;
        let result = RvcProcessor::new(config, Arc::new(FakeBackend::default()), transducer.clone());
        assert!(matches!(result, Err(RvcError::ConfigValidation(_))));
        assert_eq!(transducer.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_and_run_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Echo);
        let mut events = processor.subscribe();

        processor.load().await.unwrap();
        assert!(processor.is_loaded());
        assert_eq!(collect(&mut events), vec![ProcessorEvent::ModelLoaded]);

        let out = processor.run_one_frame(&[0.0; 8192]).unwrap();
        assert_eq!(out.len(), 8192);
        let stats = processor.get_stats();
        assert_eq!(stats.input_sample_count, 8192);
        assert_eq!(stats.output_sample_count, 8192);
        assert!(stats.processing_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn run_before_load_is_rejected_without_touching_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Echo);

        let err = processor.run_one_frame(&[0.1; 16]).unwrap_err();
        assert!(matches!(err, RvcError::SessionNotReady));
        assert_eq!(processor.get_stats(), ProcessingStats::default());
    }

    #[tokio::test]
    async fn failed_load_is_returned_and_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"garbage", Loopback::Echo);
        let mut events = processor.subscribe();

        assert!(matches!(
            processor.load().await,
            Err(RvcError::ModelLoad { .. })
        ));
        assert_eq!(processor.state(), SessionState::Unloaded);
        let events = collect(&mut events);
        assert!(matches!(events.as_slice(), [ProcessorEvent::Error(msg)] if msg.contains("bad magic")));
    }

    #[tokio::test]
    async fn inference_failure_is_returned_and_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNXFAIL", Loopback::Echo);
        processor.load().await.unwrap();
        let mut events = processor.subscribe();

        assert!(matches!(
            processor.run_one_frame(&[0.2; 32]),
            Err(RvcError::Inference(_))
        ));
        assert!(processor.is_loaded());
        assert_eq!(processor.get_stats().input_sample_count, 0);
        assert!(matches!(
            collect(&mut events).as_slice(),
            [ProcessorEvent::Error(_)]
        ));
    }

    #[tokio::test]
    async fn stats_are_copied_out() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Echo);
        processor.load().await.unwrap();
        processor.run_one_frame(&[0.0; 10]).unwrap();

        let mut snapshot = processor.get_stats();
        snapshot.input_sample_count = 999;
        assert_eq!(processor.get_stats().input_sample_count, 10);
    }

    #[tokio::test]
    async fn convert_clip_runs_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Echo);
        processor.load().await.unwrap();

        let clip = AudioClip {
            samples: vec![0.25; 1000],
            sample_rate: 16000,
        };
        let out = processor.convert_clip(&clip).unwrap();
        assert_eq!(out.samples.len(), 1000);
        assert_eq!(out.sample_rate, 16000);
        assert_eq!(processor.get_stats().input_sample_count, 1000);
    }

    #[tokio::test]
    async fn mutators_validate_and_skip_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, backend, _) = processor(dir.path(), b"ONNX", Loopback::Echo);
        processor.load().await.unwrap();

        processor.set_pitch(-7).unwrap();
        processor.set_resample_rate(44100).unwrap();
        processor.set_buffer_size(1024).unwrap();
        assert!(processor.set_pitch(13).is_err());
        assert!(processor.set_resample_rate(44010).is_err());
        assert!(processor.set_buffer_size(8).is_err());

        assert_eq!(processor.config().pitch_semitones, -7);
        assert_eq!(processor.config().resample_rate_hz, 44100);
        assert_eq!(processor.config().buffer_size_frames, 1024);
        assert!(processor.is_loaded());
        assert_eq!(backend.live_sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_normalizes_and_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Echo);
        let mut events = processor.subscribe();

        // 600 samples: two full 256-sample chunks and a 88-sample tail.
        let samples: Vec<f32> = (0..600)
            .map(|i| if i % 2 == 0 { 3.0 } else { -1.0 })
            .collect();
        let input = std::io::Cursor::new(f32le(&samples));
        let (output, mut reader) = tokio::io::duplex(64 * 1024);

        processor.process_stream(input, output).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        let stats = processor.join_stream().await.unwrap();

        let out = from_f32le(&bytes);
        assert_eq!(out.len(), 600);
        assert!(out
            .iter()
            .zip(&samples)
            .all(|(o, i)| (*o - i.signum()).abs() < 1e-6));
        assert_eq!(stats.input_sample_count, 600);
        assert_eq!(stats.output_sample_count, 600);

        let events = collect(&mut events);
        assert_eq!(events.first(), Some(&ProcessorEvent::ProcessingStart));
        assert!(matches!(
            events.last(),
            Some(ProcessorEvent::ProcessingComplete(s)) if s.output_sample_count == 600
        ));
        assert_eq!(completions(&events), 1);
    }

    #[tokio::test]
    async fn crashing_transducer_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Crash);
        let mut events = processor.subscribe();

        let input = std::io::Cursor::new(f32le(&vec![0.5; 4096]));
        let (output, mut reader) = tokio::io::duplex(64 * 1024);
        processor.process_stream(input, output).unwrap();

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        processor.join_stream().await.unwrap();

        let events = collect(&mut events);
        assert_eq!(events.first(), Some(&ProcessorEvent::ProcessingStart));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProcessorEvent::Error(msg) if msg.contains("loopback crashed"))));
        assert!(matches!(
            events.last(),
            Some(ProcessorEvent::ProcessingComplete(_))
        ));
        assert_eq!(completions(&events), 1);
    }

    #[tokio::test]
    async fn crash_with_idle_input_completes_without_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Crash);
        let mut events = processor.subscribe();

        // Input stays open and silent for the whole test.
        let (_mic, input) = tokio::io::duplex(1024);
        let (output, mut reader) = tokio::io::duplex(1024);
        processor.process_stream(input, output).unwrap();

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        assert!(bytes.is_empty());

        let stats = tokio::time::timeout(std::time::Duration::from_secs(5), processor.join_stream())
            .await
            .expect("stream should finish once the transducer output closes")
            .unwrap();
        assert_eq!(stats.input_sample_count, 0);
        assert!(!processor.is_streaming());

        let events = collect(&mut events);
        assert_eq!(events.first(), Some(&ProcessorEvent::ProcessingStart));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProcessorEvent::Error(msg) if msg.contains("loopback crashed"))));
        assert!(matches!(
            events.last(),
            Some(ProcessorEvent::ProcessingComplete(_))
        ));
        assert_eq!(completions(&events), 1);
    }

    #[tokio::test]
    async fn second_stream_is_rejected_while_first_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _, _) = processor(dir.path(), b"ONNX", Loopback::Hang);

        let (_input_tx, input) = tokio::io::duplex(1024);
        let (output, _reader) = tokio::io::duplex(1024);
        processor.process_stream(input, output).unwrap();

        let (_tx2, input2) = tokio::io::duplex(16);
        let (output2, _r2) = tokio::io::duplex(16);
        assert!(matches!(
            processor.process_stream(input2, output2),
            Err(RvcError::StreamActive)
        ));

        processor.cleanup().await;
        assert!(!processor.is_streaming());
    }

    #[tokio::test]
    async fn cleanup_terminates_stream_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, backend, _) = processor(dir.path(), b"ONNX", Loopback::Hang);
        processor.load().await.unwrap();
        processor.run_one_frame(&[0.1; 64]).unwrap();
        let mut events = processor.subscribe();

        let (_input_tx, input) = tokio::io::duplex(1024);
        let (output, _reader) = tokio::io::duplex(1024);
        processor.process_stream(input, output).unwrap();

        processor.cleanup().await;

        let seen = collect(&mut events);
        assert_eq!(completions(&seen), 1);
        assert!(matches!(
            seen.last(),
            Some(ProcessorEvent::ProcessingComplete(_))
        ));
        // Subscribers were dropped.
        assert!(events.recv().await.is_none());
        assert!(!processor.is_loaded());
        assert_eq!(processor.get_stats(), ProcessingStats::default());
        assert_eq!(backend.live_sessions.load(Ordering::SeqCst), 0);

        processor.cleanup().await;
        assert!(!processor.is_loaded());
        assert!(!processor.is_streaming());
        assert_eq!(processor.get_stats(), ProcessingStats::default());
    }

    #[tokio::test]
    async fn transducer_spawn_failure_completes_and_errors() {
        use crate::engines::rvc::transform::FfmpegTransducer;

        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path(), "voice.onnx", b"ONNX");
        let mut processor = RvcProcessor::new(
            ProcessorConfig::new(path),
            Arc::new(FakeBackend::default()),
            Arc::new(FfmpegTransducer::with_program("/nonexistent/ffmpeg-binary")),
        )
        .unwrap();
        let mut events = processor.subscribe();

        let (output, _reader) = tokio::io::duplex(16);
        let err = processor
            .process_stream(std::io::Cursor::new(Vec::new()), output)
            .unwrap_err();
        assert!(matches!(err, RvcError::FfmpegNotFound));

        let events = collect(&mut events);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ProcessorEvent::ProcessingStart);
        assert!(matches!(events[1], ProcessorEvent::Error(_)));
        assert_eq!(completions(&events), 1);
        assert!(processor.join_stream().await.is_none());
    }
}
