//! Ingestion inputs: analyzed pattern data plus the source identity of the upload

use crate::models::pattern::{InstrumentType, Onset};
use crate::models::tier::Tier;
use crate::services::acoustic_digest::AcousticDigest;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Maximum accepted source file size (50 MB)
pub const MAX_SOURCE_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// Accepted source file extensions
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "m4a", "ogg"];

/// Per-pattern output of the upstream analysis collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedPattern {
    pub instrument_type: InstrumentType,
    /// Onsets ordered by timestamp
    pub onsets: Vec<Onset>,
    pub tempo_bpm: f64,
    pub bar_length_s: f64,
    pub detected_key: String,
    pub detected_genre: String,
}

/// Identity of the whole mixed recording a pattern was cut from
#[derive(Debug, Clone, PartialEq)]
pub struct SourceIdentity {
    pub acoustic_digest: AcousticDigest,
    /// SHA-256 hex of the uploaded bytes
    pub file_hash: String,
    pub duration_s: f64,
}

/// One ingestion request
#[derive(Debug, Clone)]
pub struct Submission {
    pub user_id: Uuid,
    pub tier: Tier,
    pub song_id: Uuid,
    /// Id proposed by the caller; used only when no existing source matches
    pub source_song_id_candidate: Option<Uuid>,
    pub section_label: String,
    pub pattern: AnalyzedPattern,
    pub source: SourceIdentity,
    /// Initial quality score for the admitted pattern
    pub quality_score: f32,
}

/// Upload constraints checked before hashing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub file_name: String,
    pub size_bytes: u64,
}

impl SourceFile {
    pub fn new(file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            file_name: file_name.into(),
            size_bytes,
        }
    }

    /// Validate extension and size
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        let extension = Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(format!(
                "Unsupported format: .{}. Allowed formats: {}",
                extension,
                ALLOWED_EXTENSIONS.join(", ")
            ));
        }

        if self.size_bytes == 0 {
            return Err("Audio file is empty".to_string());
        }

        if self.size_bytes > MAX_SOURCE_FILE_BYTES {
            return Err(format!(
                "File too large: {:.2} MB. Maximum size: {} MB",
                self.size_bytes as f64 / (1024.0 * 1024.0),
                MAX_SOURCE_FILE_BYTES / (1024 * 1024)
            ));
        }

        Ok(())
    }
}
