use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a face descriptor produced by the extractor.
pub const DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is not a JSON array of numbers: {0}")]
    Malformed(String),
    #[error("expected {DESCRIPTOR_DIM}-dim descriptor, got {0}")]
    WrongLength(usize),
    #[error("descriptor value at index {0} is not finite")]
    NonFinite(usize),
}

/// Face descriptor: a fixed-length embedding for one registered face.
///
/// Stored as JSON array text. Immutable once captured; a person gets a new
/// descriptor only by re-enrolling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Build a descriptor from raw values, checking length and finiteness.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }
        Ok(Self { values })
    }

    /// Parse the stored text form (`[0.12, -0.03, ...]`).
    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        let values: Vec<f32> =
            serde_json::from_str(text).map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        Self::new(values)
    }

    /// Serialize to the stored text form.
    pub fn to_json(&self) -> String {
        // A Vec<f32> of finite values always serializes.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance between two descriptors. 0.0 means identical.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.values
    }
}
