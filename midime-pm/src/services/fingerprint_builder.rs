//! Fingerprint Builder
//!
//! Pure transform from classified onset data to the fixed 60-dimensional
//! pattern fingerprint. No side effects, no storage.
//!
//! **Layout** (identical for every instrument type; bands are kick/snare/hi-hat
//! for drums and low/mid/high register otherwise):
//!
//! | Dims   | Content                                                   |
//! |--------|-----------------------------------------------------------|
//! | 0-3    | Onset density per band (Low, Mid, High, Other), [0,1]     |
//! | 4      | Syncopation ratio, [0,1]                                  |
//! | 5-52   | 16-step binary grid for Low, Mid, High (`5 + c*16 + s`)   |
//! | 53     | Tempo, `clamp(bpm / 240, 0, 1)`                           |
//! | 54     | Velocity variance (population)                            |
//! | 55     | Mean velocity                                             |
//! | 56     | Onset rate (onsets per step over spanned bars, max 1)     |
//! | 57     | Downbeat emphasis (velocity share on steps 0, 4, 8, 12)   |
//! | 58     | Microtiming (0.5 + mean signed step offset)               |
//! | 59     | Grid occupancy (set grid bits / 48)                       |
//!
//! All arithmetic runs in f64 in input order and is narrowed to f32 at the end,
//! so identical input always yields bit-identical output.

use crate::models::pattern::{Band, InstrumentType, Onset, FINGERPRINT_DIMS};
use thiserror::Error;

/// Grid steps per bar
pub const GRID_STEPS: usize = 16;

/// First grid dimension
pub const GRID_OFFSET: usize = 5;

/// Tempo that maps to 1.0 in the tempo dimension
pub const TEMPO_NORMALIZATION_BPM: f64 = 240.0;

pub const DIM_SYNCOPATION: usize = 4;
pub const DIM_TEMPO: usize = 53;
pub const DIM_VELOCITY_VARIANCE: usize = 54;
pub const DIM_MEAN_VELOCITY: usize = 55;
pub const DIM_ONSET_RATE: usize = 56;
pub const DIM_DOWNBEAT_EMPHASIS: usize = 57;
pub const DIM_MICROTIMING: usize = 58;
pub const DIM_GRID_OCCUPANCY: usize = 59;

/// Minimum onsets for a meaningful fingerprint
pub const MIN_ONSETS: usize = 2;

/// Fingerprint construction errors
#[derive(Debug, Error, PartialEq)]
pub enum FingerprintError {
    /// Too few onsets to encode rhythm or harmony. Not retried.
    #[error("Insufficient data: {count} onset(s), at least {MIN_ONSETS} required")]
    InsufficientData { count: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Dimension of grid cell `step` for grid band `band`
pub fn grid_dim(band: Band, step: usize) -> Option<usize> {
    let component = Band::GRID.iter().position(|b| *b == band)?;
    Some(GRID_OFFSET + component * GRID_STEPS + step)
}

/// Fingerprint Builder
pub struct FingerprintBuilder;

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the fingerprint vector for one classified pattern
    ///
    /// **Algorithm:**
    /// 1. Validate inputs (at least two ordered onsets, positive tempo and bar length)
    /// 2. Fold each onset into the bar (`t mod bar_length`)
    /// 3. Set grid bits for onsets within ±bar_length/32 of a step (circular)
    /// 4. Count off-grid onsets (further than bar_length/64 from the nearest step)
    /// 5. Derive density, velocity and groove-shape scalars
    ///
    /// # Errors
    /// * `InsufficientData` when fewer than 2 onsets are supplied
    /// * `InvalidInput` for non-finite values, velocities outside [0,1],
    ///   unordered onsets, or non-positive tempo/bar length
    pub fn build(
        &self,
        instrument_type: InstrumentType,
        onsets: &[Onset],
        tempo_bpm: f64,
        bar_length_s: f64,
    ) -> Result<Vec<f32>, FingerprintError> {
        validate(onsets, tempo_bpm, bar_length_s)?;

        let n = onsets.len() as f64;
        let step = bar_length_s / GRID_STEPS as f64;
        let grid_tolerance = bar_length_s / 32.0;
        let sync_tolerance = bar_length_s / 64.0;

        let mut dims = [0.0f64; FINGERPRINT_DIMS];
        let mut band_counts = [0usize; 4];
        let mut off_grid = 0usize;
        let mut velocity_sum = 0.0f64;
        let mut downbeat_velocity = 0.0f64;
        let mut offset_sum = 0.0f64;
        let mut max_timestamp = 0.0f64;

        for onset in onsets {
            band_counts[onset.band.index()] += 1;
            velocity_sum += onset.velocity;
            max_timestamp = max_timestamp.max(onset.timestamp_s);

            let position = onset.timestamp_s.rem_euclid(bar_length_s);
            let nearest = (position / step).round();
            let offset = position - nearest * step;
            let nearest_step = (nearest as usize) % GRID_STEPS;
            let on_grid = offset.abs() <= sync_tolerance;

            if !on_grid {
                off_grid += 1;
            }
            if on_grid && nearest_step % 4 == 0 {
                downbeat_velocity += onset.velocity;
            }
            offset_sum += offset / step;

            for s in 0..GRID_STEPS {
                let nominal = s as f64 * step;
                let direct = (position - nominal).abs();
                let distance = direct.min(bar_length_s - direct);
                if distance <= grid_tolerance {
                    if let Some(dim) = grid_dim(onset.band, s) {
                        dims[dim] = 1.0;
                    }
                }
            }
        }

        for band in Band::ALL {
            dims[band.index()] = band_counts[band.index()] as f64 / n;
        }
        dims[DIM_SYNCOPATION] = off_grid as f64 / n;

        let mean_velocity = velocity_sum / n;
        let variance = onsets
            .iter()
            .map(|o| {
                let d = o.velocity - mean_velocity;
                d * d
            })
            .sum::<f64>()
            / n;

        let bars_spanned = (max_timestamp / bar_length_s).floor() + 1.0;
        let grid_bits = dims[GRID_OFFSET..GRID_OFFSET + Band::GRID.len() * GRID_STEPS]
            .iter()
            .filter(|v| **v > 0.0)
            .count();

        dims[DIM_TEMPO] = (tempo_bpm / TEMPO_NORMALIZATION_BPM).clamp(0.0, 1.0);
        dims[DIM_VELOCITY_VARIANCE] = variance;
        dims[DIM_MEAN_VELOCITY] = mean_velocity;
        dims[DIM_ONSET_RATE] = (n / (GRID_STEPS as f64 * bars_spanned)).min(1.0);
        dims[DIM_DOWNBEAT_EMPHASIS] = if velocity_sum > 0.0 {
            downbeat_velocity / velocity_sum
        } else {
            0.0
        };
        dims[DIM_MICROTIMING] = (0.5 + offset_sum / n).clamp(0.0, 1.0);
        dims[DIM_GRID_OCCUPANCY] = grid_bits as f64 / (Band::GRID.len() * GRID_STEPS) as f64;

        let vector: Vec<f32> = dims.iter().map(|v| *v as f32).collect();
        debug_assert_eq!(vector.len(), instrument_type.fingerprint_dims());

        tracing::trace!(
            instrument = %instrument_type,
            onsets = onsets.len(),
            grid_bits,
            "Built fingerprint"
        );

        Ok(vector)
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(onsets: &[Onset], tempo_bpm: f64, bar_length_s: f64) -> Result<(), FingerprintError> {
    if onsets.len() < MIN_ONSETS {
        return Err(FingerprintError::InsufficientData {
            count: onsets.len(),
        });
    }
    if !tempo_bpm.is_finite() || tempo_bpm <= 0.0 {
        return Err(FingerprintError::InvalidInput(format!(
            "tempo must be positive, got {}",
            tempo_bpm
        )));
    }
    if !bar_length_s.is_finite() || bar_length_s <= 0.0 {
        return Err(FingerprintError::InvalidInput(format!(
            "bar length must be positive, got {}",
            bar_length_s
        )));
    }

    let mut previous = f64::NEG_INFINITY;
    for (i, onset) in onsets.iter().enumerate() {
        if !onset.timestamp_s.is_finite() || onset.timestamp_s < 0.0 {
            return Err(FingerprintError::InvalidInput(format!(
                "onset {} has invalid timestamp {}",
                i, onset.timestamp_s
            )));
        }
        if !onset.velocity.is_finite() || !(0.0..=1.0).contains(&onset.velocity) {
            return Err(FingerprintError::InvalidInput(format!(
                "onset {} velocity {} outside [0, 1]",
                i, onset.velocity
            )));
        }
        if onset.timestamp_s < previous {
            return Err(FingerprintError::InvalidInput(format!(
                "onset {} is out of order",
                i
            )));
        }
        previous = onset.timestamp_s;
    }
    Ok(())
}
