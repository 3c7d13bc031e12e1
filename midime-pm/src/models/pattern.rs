//! Pattern records and the onset vocabulary shared with the analysis stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Fingerprint dimensionality (identical for every instrument type)
pub const FINGERPRINT_DIMS: usize = 60;

/// Pattern construction errors
#[derive(Debug, Error, PartialEq)]
pub enum PatternError {
    /// Fingerprint length does not match the instrument's fixed dimension.
    /// Programming/config error, never shown to end users.
    #[error("Invalid vector dimension for {instrument}: expected {expected}, got {actual}")]
    InvalidVectorDimension {
        instrument: InstrumentType,
        expected: usize,
        actual: usize,
    },

    /// Fingerprint contains NaN or infinity
    #[error("Fingerprint component {0} is not finite")]
    NonFiniteComponent(usize),

    #[error("Unknown instrument type: {0}")]
    UnknownInstrument(String),
}

/// Instrument type; each has its own fingerprint space and is never compared
/// against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Drums,
    Bass,
    Harmony,
    Melody,
}

impl InstrumentType {
    pub const ALL: [InstrumentType; 4] = [
        InstrumentType::Drums,
        InstrumentType::Bass,
        InstrumentType::Harmony,
        InstrumentType::Melody,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Drums => "drums",
            InstrumentType::Bass => "bass",
            InstrumentType::Harmony => "harmony",
            InstrumentType::Melody => "melody",
        }
    }

    /// Fixed fingerprint dimension for this instrument type
    pub fn fingerprint_dims(&self) -> usize {
        FINGERPRINT_DIMS
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentType {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drums" => Ok(InstrumentType::Drums),
            "bass" => Ok(InstrumentType::Bass),
            "harmony" => Ok(InstrumentType::Harmony),
            "melody" => Ok(InstrumentType::Melody),
            other => Err(PatternError::UnknownInstrument(other.to_string())),
        }
    }
}

/// Frequency band / sub-component of an onset
///
/// For drums the bands are the classifier's kick (20-100 Hz), snare
/// (150-250 Hz) and hi-hat (5-10 kHz) energy bands; anything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Low,
    Mid,
    High,
    Other,
}

impl Band {
    pub const ALL: [Band; 4] = [Band::Low, Band::Mid, Band::High, Band::Other];

    /// Bands that appear in the binary groove grid
    pub const GRID: [Band; 3] = [Band::Low, Band::Mid, Band::High];

    pub fn index(&self) -> usize {
        match self {
            Band::Low => 0,
            Band::Mid => 1,
            Band::High => 2,
            Band::Other => 3,
        }
    }

    /// General MIDI percussion note for a drum onset in this band
    pub fn drum_midi_note(&self) -> Option<u8> {
        match self {
            Band::Low => Some(36),  // Bass Drum 1
            Band::Mid => Some(38),  // Acoustic Snare
            Band::High => Some(42), // Closed Hi-Hat
            Band::Other => None,
        }
    }
}

/// Classified onset delivered by the analysis stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Onset {
    /// Onset time in seconds from pattern start
    pub timestamp_s: f64,
    /// Velocity in [0, 1]
    pub velocity: f64,
    pub band: Band,
}

impl Onset {
    pub fn new(timestamp_s: f64, velocity: f64, band: Band) -> Self {
        Self {
            timestamp_s,
            velocity,
            band,
        }
    }
}

/// Per-band hit counts of a classified pattern
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternSummary {
    pub total_hits: usize,
    /// Hit counts indexed by `Band::index()`
    pub counts: [usize; 4],
    /// Percentages indexed by `Band::index()` (0 when there are no hits)
    pub percentages: [f64; 4],
}

impl PatternSummary {
    pub fn from_onsets(onsets: &[Onset]) -> Self {
        let mut counts = [0usize; 4];
        for onset in onsets {
            counts[onset.band.index()] += 1;
        }
        let total_hits = onsets.len();
        let mut percentages = [0.0; 4];
        if total_hits > 0 {
            for (pct, count) in percentages.iter_mut().zip(counts.iter()) {
                *pct = *count as f64 / total_hits as f64 * 100.0;
            }
        }
        Self {
            total_hits,
            counts,
            percentages,
        }
    }
}

/// Admitted pattern
///
/// Immutable once inserted except for `quality_score`. The fingerprint length
/// always matches `instrument_type.fingerprint_dims()`.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub pattern_id: Uuid,
    pub song_id: Uuid,
    pub source_song_id: Uuid,
    pub instrument_type: InstrumentType,
    fingerprint: Arc<[f32]>,
    pub tempo: f32,
    pub key_signature: String,
    pub genre: String,
    pub section_label: String,
    pub quality_score: f32,
    pub created_at: DateTime<Utc>,
}

impl Pattern {
    /// Create a pattern, validating the fingerprint against the instrument dimension
    pub fn new(instrument_type: InstrumentType, fingerprint: Vec<f32>) -> Result<Self, PatternError> {
        validate_fingerprint(instrument_type, &fingerprint)?;
        Ok(Self {
            pattern_id: Uuid::new_v4(),
            song_id: Uuid::nil(),
            source_song_id: Uuid::nil(),
            instrument_type,
            fingerprint: fingerprint.into(),
            tempo: 0.0,
            key_signature: String::new(),
            genre: String::new(),
            section_label: String::new(),
            quality_score: 0.0,
            created_at: Utc::now(),
        })
    }

    pub fn with_id(mut self, pattern_id: Uuid) -> Self {
        self.pattern_id = pattern_id;
        self
    }

    pub fn with_source(mut self, song_id: Uuid, source_song_id: Uuid) -> Self {
        self.song_id = song_id;
        self.source_song_id = source_song_id;
        self
    }

    pub fn with_tempo(mut self, tempo: f32) -> Self {
        self.tempo = tempo;
        self
    }

    pub fn with_key(mut self, key_signature: impl Into<String>) -> Self {
        self.key_signature = key_signature.into();
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = genre.into();
        self
    }

    pub fn with_section(mut self, section_label: impl Into<String>) -> Self {
        self.section_label = section_label.into();
        self
    }

    pub fn with_quality(mut self, quality_score: f32) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn fingerprint(&self) -> &[f32] {
        &self.fingerprint
    }
}

/// Check a vector against an instrument's fixed dimension
pub fn validate_fingerprint(
    instrument_type: InstrumentType,
    fingerprint: &[f32],
) -> Result<(), PatternError> {
    let expected = instrument_type.fingerprint_dims();
    if fingerprint.len() != expected {
        return Err(PatternError::InvalidVectorDimension {
            instrument: instrument_type,
            expected,
            actual: fingerprint.len(),
        });
    }
    if let Some(idx) = fingerprint.iter().position(|v| !v.is_finite()) {
        return Err(PatternError::NonFiniteComponent(idx));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_dimension_is_rejected() {
        let err = Pattern::new(InstrumentType::Drums, vec![0.0; 59]).unwrap_err();
        assert_eq!(
            err,
            PatternError::InvalidVectorDimension {
                instrument: InstrumentType::Drums,
                expected: 60,
                actual: 59,
            }
        );
    }

    #[test]
    fn test_non_finite_component_is_rejected() {
        let mut v = vec![0.5; FINGERPRINT_DIMS];
        v[7] = f32::NAN;
        assert_eq!(
            Pattern::new(InstrumentType::Bass, v).unwrap_err(),
            PatternError::NonFiniteComponent(7)
        );
    }

    #[test]
    fn test_instrument_round_trips_through_str() {
        for instrument in InstrumentType::ALL {
            assert_eq!(instrument.as_str().parse::<InstrumentType>().unwrap(), instrument);
        }
        assert!("theremin".parse::<InstrumentType>().is_err());
    }

    #[test]
    fn test_drum_midi_notes() {
        assert_eq!(Band::Low.drum_midi_note(), Some(36));
        assert_eq!(Band::Mid.drum_midi_note(), Some(38));
        assert_eq!(Band::High.drum_midi_note(), Some(42));
        assert_eq!(Band::Other.drum_midi_note(), None);
    }

    #[test]
    fn test_pattern_summary() {
        let onsets = vec![
            Onset::new(0.0, 1.0, Band::Low),
            Onset::new(0.5, 0.5, Band::High),
            Onset::new(1.0, 1.0, Band::Mid),
            Onset::new(1.5, 0.5, Band::High),
        ];
        let summary = PatternSummary::from_onsets(&onsets);
        assert_eq!(summary.total_hits, 4);
        assert_eq!(summary.counts, [1, 1, 2, 0]);
        assert_eq!(summary.percentages[2], 50.0);

        let empty = PatternSummary::from_onsets(&[]);
        assert_eq!(empty.percentages, [0.0; 4]);
    }
}
