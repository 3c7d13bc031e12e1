//! Acoustic Digest
//!
//! Content-based source identity for whole mixed recordings (before stem
//! separation). Produces a coarse acoustic code that survives re-encoding and
//! small trims, plus an exact SHA-256 of the uploaded bytes. Never used for
//! pattern similarity.
//!
//! **Algorithm:**
//! 1. Slice mono audio into 0.2 s Hann-windowed frames with a 25 ms hop
//! 2. Measure energy in 33 log-spaced bands (300-2000 Hz) with Goertzel filters
//! 3. Emit one 32-bit sub-fingerprint per frame from the sign of the
//!    band-difference change between consecutive frames
//! 4. Keep a fixed 256-frame code; compare codes by best bit agreement over
//!    ±40 frame shifts

use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sub-fingerprints per digest
pub const DIGEST_FRAMES: usize = 256;

/// Energy bands (adjacent pairs yield 32 bits)
pub const DIGEST_BANDS: usize = 33;

pub const FRAME_SECONDS: f64 = 0.2;
pub const HOP_SECONDS: f64 = 0.025;

const LOWEST_BAND_HZ: f64 = 300.0;
const HIGHEST_BAND_HZ: f64 = 2000.0;

/// Largest alignment shift tried when comparing (1 s of trim)
pub const MAX_SHIFT_FRAMES: usize = 40;

/// Minimum overlapping frames for a comparison to count
pub const MIN_OVERLAP_FRAMES: usize = 32;

/// RMS below which audio is treated as silence
const SILENCE_RMS: f64 = 1e-4;

/// Digest errors
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("Audio too short: {frames} frame(s), at least {MIN_OVERLAP_FRAMES} required")]
    AudioTooShort { frames: usize },

    #[error("Audio is silent")]
    Silent,

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid digest encoding: {0}")]
    Encoding(String),
}

/// Decoded mono audio handed over by the decoding collaborator
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Fixed-length acoustic code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcousticDigest {
    /// Always `DIGEST_FRAMES` long; entries past `valid_frames` are zero
    frames: Vec<u32>,
    valid_frames: usize,
}

impl AcousticDigest {
    /// Build from sub-fingerprints, truncating or zero-padding to `DIGEST_FRAMES`
    pub fn from_frames(mut frames: Vec<u32>) -> Self {
        let valid_frames = frames.len().min(DIGEST_FRAMES);
        frames.resize(DIGEST_FRAMES, 0);
        Self {
            frames,
            valid_frames,
        }
    }

    pub fn valid_frames(&self) -> usize {
        self.valid_frames
    }

    pub fn frames(&self) -> &[u32] {
        &self.frames[..self.valid_frames]
    }

    /// Similarity in [0, 1]: best bit agreement over alignment shifts
    ///
    /// Returns 0.0 when no shift leaves `MIN_OVERLAP_FRAMES` overlapping frames.
    pub fn similarity(&self, other: &AcousticDigest) -> f32 {
        let a = self.frames();
        let b = other.frames();
        let mut best = 0.0f64;

        for shift in -(MAX_SHIFT_FRAMES as isize)..=(MAX_SHIFT_FRAMES as isize) {
            let (a_start, b_start) = if shift >= 0 {
                (0usize, shift as usize)
            } else {
                ((-shift) as usize, 0usize)
            };
            if a_start >= a.len() || b_start >= b.len() {
                continue;
            }
            let overlap = (a.len() - a_start).min(b.len() - b_start);
            if overlap < MIN_OVERLAP_FRAMES {
                continue;
            }

            let differing: u32 = a[a_start..a_start + overlap]
                .iter()
                .zip(&b[b_start..b_start + overlap])
                .map(|(x, y)| (x ^ y).count_ones())
                .sum();
            let agreement = 1.0 - differing as f64 / (32.0 * overlap as f64);
            if agreement > best {
                best = agreement;
            }
        }

        best as f32
    }

    /// Base64 encoding: valid frame count then frames, little-endian u32
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(4 + DIGEST_FRAMES * 4);
        bytes.extend_from_slice(&(self.valid_frames as u32).to_le_bytes());
        for frame in &self.frames {
            bytes.extend_from_slice(&frame.to_le_bytes());
        }
        general_purpose::STANDARD.encode(bytes)
    }

    pub fn decode(encoded: &str) -> Result<Self, DigestError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| DigestError::Encoding(e.to_string()))?;
        if bytes.len() != 4 + DIGEST_FRAMES * 4 {
            return Err(DigestError::Encoding(format!(
                "expected {} bytes, got {}",
                4 + DIGEST_FRAMES * 4,
                bytes.len()
            )));
        }

        let valid_frames = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if valid_frames > DIGEST_FRAMES {
            return Err(DigestError::Encoding(format!(
                "valid frame count {} exceeds {}",
                valid_frames, DIGEST_FRAMES
            )));
        }

        let frames = bytes[4..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            frames,
            valid_frames,
        })
    }
}

/// Acoustic digest plus exact byte hash of one upload
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDigest {
    pub acoustic_digest: AcousticDigest,
    pub file_hash: String,
}

/// Compute the source digest of an upload
pub fn digest(audio: &DecodedAudio, file_bytes: &[u8]) -> Result<SourceDigest, DigestError> {
    Ok(SourceDigest {
        acoustic_digest: acoustic_digest(audio)?,
        file_hash: file_hash(file_bytes),
    })
}

/// SHA-256 hex of raw bytes
pub fn file_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Compute the acoustic digest of decoded audio
pub fn acoustic_digest(audio: &DecodedAudio) -> Result<AcousticDigest, DigestError> {
    if audio.sample_rate < 2 * HIGHEST_BAND_HZ as u32 + 1 {
        return Err(DigestError::InvalidSampleRate(audio.sample_rate));
    }

    let sample_rate = audio.sample_rate as f64;
    let frame_len = (FRAME_SECONDS * sample_rate).round() as usize;
    let hop = (HOP_SECONDS * sample_rate).round() as usize;

    let available = if audio.samples.len() >= frame_len {
        (audio.samples.len() - frame_len) / hop + 1
    } else {
        0
    };
    // One extra energy frame: sub-fingerprints are frame differences
    let energy_frames = available.min(DIGEST_FRAMES + 1);
    if energy_frames < MIN_OVERLAP_FRAMES + 1 {
        return Err(DigestError::AudioTooShort {
            frames: energy_frames.saturating_sub(1),
        });
    }

    let rms = (audio
        .samples
        .iter()
        .map(|s| (*s as f64) * (*s as f64))
        .sum::<f64>()
        / audio.samples.len() as f64)
        .sqrt();
    if rms < SILENCE_RMS {
        return Err(DigestError::Silent);
    }

    let window: Vec<f64> = (0..frame_len)
        .map(|i| {
            0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (frame_len - 1) as f64).cos()
        })
        .collect();
    let coefficients: Vec<f64> = band_frequencies()
        .iter()
        .map(|f| 2.0 * (2.0 * std::f64::consts::PI * f / sample_rate).cos())
        .collect();

    let energies: Vec<[f64; DIGEST_BANDS]> = (0..energy_frames)
        .map(|n| {
            let frame = &audio.samples[n * hop..n * hop + frame_len];
            let mut bands = [0.0f64; DIGEST_BANDS];
            for (band, coeff) in bands.iter_mut().zip(&coefficients) {
                *band = goertzel_power(frame, &window, *coeff);
            }
            bands
        })
        .collect();

    let frames: Vec<u32> = energies
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            let mut bits = 0u32;
            for m in 0..DIGEST_BANDS - 1 {
                let delta = (cur[m] - cur[m + 1]) - (prev[m] - prev[m + 1]);
                if delta > 0.0 {
                    bits |= 1 << m;
                }
            }
            bits
        })
        .collect();

    tracing::debug!(
        frames = frames.len(),
        sample_rate = audio.sample_rate,
        "Acoustic digest computed"
    );

    Ok(AcousticDigest::from_frames(frames))
}

fn band_frequencies() -> [f64; DIGEST_BANDS] {
    let ratio = HIGHEST_BAND_HZ / LOWEST_BAND_HZ;
    let mut freqs = [0.0f64; DIGEST_BANDS];
    for (i, f) in freqs.iter_mut().enumerate() {
        *f = LOWEST_BAND_HZ * ratio.powf(i as f64 / (DIGEST_BANDS - 1) as f64);
    }
    freqs
}

fn goertzel_power(frame: &[f32], window: &[f64], coeff: f64) -> f64 {
    let mut s_prev = 0.0f64;
    let mut s_prev2 = 0.0f64;
    for (sample, w) in frame.iter().zip(window) {
        let s = *sample as f64 * w + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }
    s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2
}
