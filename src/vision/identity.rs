//! Presence DLP - Identity Matching
//!
//! Enrolled templates live in memory as [`KnownTemplates`]; a face is known
//! when any template lies within the distance tolerance of its embedding.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DlpResult;
use crate::storage::Storage;
use crate::vault::CryptoVault;

/// Face location on the search frame, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }
}

/// Fixed-length face embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean distance; vectors of different length never match
    pub fn distance(&self, other: &FeatureVector) -> f32 {
        if self.0.len() != other.0.len() {
            return f32::INFINITY;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// In-memory cache of enrolled templates
#[derive(Debug, Clone, Default)]
pub struct KnownTemplates {
    templates: Vec<FeatureVector>,
    tolerance: f32,
}

impl KnownTemplates {
    pub fn new(templates: Vec<FeatureVector>, tolerance: f32) -> Self {
        Self {
            templates,
            tolerance,
        }
    }

    /// Unwrap every enrolled template. A template that fails to decrypt or
    /// decode is skipped with a warning.
    pub fn load(storage: &dyn Storage, vault: &CryptoVault, tolerance: f32) -> DlpResult<Self> {
        let mut templates = Vec::new();

        for record in storage.all_encodings()? {
            if record.wrapped_template.is_empty() {
                continue;
            }
            let decoded = vault
                .decrypt_bytes(&record.wrapped_template)
                .and_then(|plain| Ok(bincode::deserialize::<FeatureVector>(&plain)?));

            match decoded {
                Ok(template) => templates.push(template),
                Err(e) => warn!("Skipping template of user #{} ({}): {}", record.id, record.name, e),
            }
        }

        info!("Loaded {} face templates", templates.len());
        Ok(Self::new(templates, tolerance))
    }

    /// True when any template is within tolerance
    pub fn matches(&self, candidate: &FeatureVector) -> bool {
        self.templates
            .iter()
            .any(|t| t.distance(candidate) <= self.tolerance)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }
}
