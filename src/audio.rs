//! Utterance audio normalization
//!
//! Clients send either a WAV file or raw little-endian `f32` PCM. Providers
//! only ever see WAV.

use crate::{Error, Result};

/// Encode mono float samples as 16-bit PCM WAV
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let pcm = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(pcm)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Whether `bytes` starts with a RIFF/WAVE header
#[must_use]
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Turn an uploaded utterance into WAV bytes
///
/// WAV input passes through untouched; anything else is read as
/// little-endian `f32` samples at `sample_rate`.
///
/// # Errors
///
/// Returns [`Error::Audio`] for empty input or a buffer that is not a whole
/// number of samples
pub fn normalize_utterance(bytes: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    if bytes.is_empty() {
        return Err(Error::Audio("empty audio buffer".to_string()));
    }
    if is_wav(bytes) {
        return Ok(bytes.to_vec());
    }
    if bytes.len() % 4 != 0 {
        return Err(Error::Audio(format!(
            "raw PCM length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .map(|s| if s.is_finite() { s } else { 0.0 })
        .collect();
    tracing::debug!(samples = samples.len(), sample_rate, "converted raw PCM utterance");
    samples_to_wav(&samples, sample_rate)
}
