use serde::{Deserialize, Serialize};

/// One finding reported by the inference program. Forwarded to the caller
/// exactly as it was decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    /// `[x, y, width, height]` in image pixels.
    pub bbox: [f64; 4],
}

/// The JSON record the inference program prints as its last stdout line.
#[derive(Debug, Deserialize)]
pub struct InferenceReport {
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub image_shape: Option<Vec<u32>>,
    #[serde(default)]
    pub num_detections: Option<usize>,
}
