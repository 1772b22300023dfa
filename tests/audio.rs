//! Utterance audio integration tests
//!
//! Exercises the WAV/PCM normalization clients rely on without any audio hardware

use std::io::Cursor;

use tokio_test::{assert_err, assert_ok};
use voiceclaw::audio::{is_wav, normalize_utterance, samples_to_wav};

const SAMPLE_RATE: u32 = 48_000;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

fn to_le_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    assert!(is_wav(&wav_data));
    assert_eq!(wav_data.len(), 44 + samples.len() * 2);
}

#[test]
fn test_raw_pcm_utterance_roundtrip() {
    let samples = generate_sine_samples(220.0, 0.05, 0.8);
    let wav = normalize_utterance(&to_le_bytes(&samples), SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read.len(), samples.len());
    let peak = read.iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!(peak > 20_000 && peak < 27_000, "peak {peak} should be near 0.8 of full scale");
}

#[test]
fn test_uploaded_wav_is_untouched() {
    let wav = assert_ok!(samples_to_wav(&generate_sine_samples(440.0, 0.02, 0.3), 16_000));
    assert_eq!(assert_ok!(normalize_utterance(&wav, SAMPLE_RATE)), wav);
}

#[test]
fn test_non_finite_samples_become_silence() {
    let wav = normalize_utterance(&to_le_bytes(&[f32::NAN, f32::INFINITY, 0.5]), SAMPLE_RATE).unwrap();
    let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(&read[..2], &[0, 0]);
    assert!(read[2] > 0);
}

#[test]
fn test_malformed_pcm_is_rejected() {
    assert_err!(normalize_utterance(&[], SAMPLE_RATE));
    assert_err!(normalize_utterance(&[0, 0, 128], SAMPLE_RATE));
}
