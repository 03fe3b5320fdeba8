use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use voice_filter_rs::{
    engines::rvc::{
        FfmpegTransducer, OrtBackend, ProcessorConfig, ProcessorEvent, RvcProcessor,
    },
    AudioClip,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let model_path = PathBuf::from(
        args.next()
            .unwrap_or_else(|| "discord_voice_filters/reyna.onnx".to_string()),
    );
    let input_path = PathBuf::from(args.next().unwrap_or_else(|| "input.wav".to_string()));
    let pitch: i32 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(0);

    let clip = AudioClip::read_wav(&input_path)?;
    println!(
        "Read {:.2}s of audio at {} Hz",
        clip.duration_secs(),
        clip.sample_rate
    );

    let config = ProcessorConfig::builder()
        .model_path(model_path)
        .pitch_semitones(pitch)
        .input_sample_rate_hz(clip.sample_rate)
        .build()?;
    let mut processor = RvcProcessor::new(
        config,
        Arc::new(OrtBackend::new()),
        Arc::new(FfmpegTransducer::new()),
    )?;
    let mut events = processor.subscribe();

    let load_start = Instant::now();
    processor.load().await?;
    println!("Model loaded in {:.2?}", load_start.elapsed());

    let convert_start = Instant::now();
    let converted = processor.convert_clip(&clip)?;
    let convert_dur = convert_start.elapsed();
    println!(
        "Converted {:.2}s audio in {:.2?} ({:.1}x real-time)",
        clip.duration_secs(),
        convert_dur,
        clip.duration_secs() / convert_dur.as_secs_f64()
    );
    converted.write_wav(&PathBuf::from("converted.wav"))?;
    println!("Saved to converted.wav");

    // Stream the original clip through the pitch/resample transducer.
    let raw: Vec<u8> = clip.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let (output, mut shifted) = tokio::io::duplex(64 * 1024);
    processor.process_stream(std::io::Cursor::new(raw), output)?;

    let mut bytes = Vec::new();
    shifted.read_to_end(&mut bytes).await?;
    let stats = processor.join_stream().await.unwrap_or_default();

    while let Ok(event) = events.try_recv() {
        if let ProcessorEvent::Error(message) = event {
            eprintln!("Stream error: {message}");
        }
    }

    let samples = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let pitched = AudioClip {
        samples,
        sample_rate: processor.config().resample_rate_hz,
    };
    pitched.write_wav(&PathBuf::from("pitched.wav"))?;
    println!(
        "Streamed {} samples in, {} out in {:.1} ms; saved to pitched.wav",
        stats.input_sample_count, stats.output_sample_count, stats.processing_time_ms
    );

    processor.cleanup().await;
    Ok(())
}
