use crate::detection::{Detection, InferenceReport};
use crate::error::PipelineError;
use std::path::Path;

/// Reads the detections from the last non-empty stdout line.
///
/// Anything before that line is diagnostic chatter. A missing or malformed
/// report is logged and yields no detections; it never fails the request.
pub fn parse_detections(stdout: &str) -> Vec<Detection> {
    let Some(last_line) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        tracing::warn!("Inference program printed nothing on stdout, returning no detections");
        return Vec::new();
    };

    match serde_json::from_str::<InferenceReport>(last_line) {
        Ok(report) => {
            if let Some(expected) = report.num_detections {
                if expected != report.detections.len() {
                    tracing::warn!(
                        "Inference report claims {} detections but lists {}",
                        expected,
                        report.detections.len()
                    );
                }
            }
            tracing::debug!(
                image_shape = ?report.image_shape,
                "Decoded {} detections",
                report.detections.len()
            );
            report.detections
        }
        Err(e) => {
            tracing::warn!(
                "Could not parse inference report `{}`: {}. Returning no detections",
                last_line,
                e
            );
            Vec::new()
        }
    }
}

/// Loads the annotated image the program was required to write.
pub async fn read_output_artifact(path: &Path) -> Result<Vec<u8>, PipelineError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!("Inference program wrote no output at {}", path.display());
            Err(PipelineError::MissingOutputArtifact {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(PipelineError::UnexpectedFailure(format!(
            "failed to read output image {}: {}",
            path.display(),
            e
        ))),
    }
}
