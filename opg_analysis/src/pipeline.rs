use crate::config::{DownloadConfig, PipelineConfig};
use crate::decode::{parse_detections, read_output_artifact};
use crate::detection::Detection;
use crate::error::PipelineError;
use crate::inference::InferenceProgram;
use crate::staging::{AnalysisRequest, ImageDownloader, ScratchFiles};
use base64::{engine::general_purpose, Engine};
use serde::Serialize;
use std::path::PathBuf;
use tracing::instrument;

/// Body returned to the caller when an analysis succeeds.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub success: bool,
    pub annotated_image: String,
    pub detections: Vec<Detection>,
}

impl AnalysisResponse {
    pub fn new(annotated_image: &[u8], detections: Vec<Detection>) -> Self {
        Self {
            success: true,
            annotated_image: format!(
                "data:image/jpeg;base64,{}",
                general_purpose::STANDARD.encode(annotated_image)
            ),
            detections,
        }
    }
}

/// Stages an image, runs the inference program on it and assembles the
/// response. Each call is independent; nothing is shared between calls
/// except the read-only program and weights.
pub struct AnalysisPipeline {
    enabled: bool,
    scratch_dir: PathBuf,
    downloader: ImageDownloader,
    program: InferenceProgram,
}

impl AnalysisPipeline {
    pub fn new(
        pipeline_config: &PipelineConfig,
        download_config: &DownloadConfig,
    ) -> Result<Self, PipelineError> {
        pipeline_config
            .validate()
            .map_err(PipelineError::UnexpectedFailure)?;

        Ok(Self {
            enabled: pipeline_config.enabled,
            scratch_dir: pipeline_config.scratch_dir.clone(),
            downloader: ImageDownloader::new(download_config)?,
            program: InferenceProgram::new(pipeline_config),
        })
    }

    pub fn ensure_available(&self) -> Result<(), PipelineError> {
        if self.enabled {
            Ok(())
        } else {
            Err(PipelineError::Unavailable)
        }
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id, image_url = %request.image_url))]
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, PipelineError> {
        self.ensure_available()?;

        // Dropping `scratch` removes both files, whichever way this returns.
        let scratch = ScratchFiles::create(&self.scratch_dir, &request.user_id).await?;

        self.downloader
            .download_to(&request.image_url, scratch.input())
            .await?;

        let output = self.program.run(scratch.input(), scratch.output()).await?;

        let detections = parse_detections(&output.stdout);
        let annotated_image = read_output_artifact(scratch.output()).await?;

        tracing::info!(
            "Analysis complete with {} detections ({} byte image)",
            detections.len(),
            annotated_image.len()
        );

        Ok(AnalysisResponse::new(&annotated_image, detections))
    }
}
