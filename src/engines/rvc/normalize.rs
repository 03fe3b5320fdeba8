use super::model::RvcError;

/// Remove the DC offset from a frame and scale it down to unit peak.
///
/// The mean of the frame is subtracted from every sample. If the peak
/// absolute value of the result exceeds 1.0 every sample is divided by that
/// peak, otherwise the frame is left unscaled. Output has the same length as
/// the input.
pub fn normalize(frame: &[f32]) -> Result<Vec<f32>, RvcError> {
    let mut out = frame.to_vec();
    normalize_in_place(&mut out)?;
    Ok(out)
}

/// In-place variant of [`normalize`], used on the streaming path to avoid a
/// second allocation per chunk.
pub fn normalize_in_place(frame: &mut [f32]) -> Result<(), RvcError> {
    if frame.is_empty() {
        return Err(RvcError::EmptyInput);
    }

    // Accumulate in f64 so long frames don't drift.
    let sum: f64 = frame.iter().map(|&s| s as f64).sum();
    let dc_offset = (sum / frame.len() as f64) as f32;

    let mut peak = 0.0f32;
    for sample in frame.iter_mut() {
        *sample -= dc_offset;
        peak = peak.max(sample.abs());
    }

    if peak > 1.0 {
        for sample in frame.iter_mut() {
            *sample /= peak;
        }
    }

    Ok(())
}
