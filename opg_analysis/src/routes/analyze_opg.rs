use crate::{
    error::PipelineError,
    pipeline::AnalysisResponse,
    server::SharedState,
    staging::AnalysisRequest,
};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

#[derive(Debug, Default)]
struct AnalysisForm {
    image_url: Option<String>,
    user_id: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<AnalysisForm, PipelineError> {
    let mut form = AnalysisForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::InvalidRequest(format!("malformed form data: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let slot = match name.as_str() {
            "imageUrl" => &mut form.image_url,
            "userId" => &mut form.user_id,
            _ => continue,
        };
        let value = field
            .text()
            .await
            .map_err(|e| PipelineError::InvalidRequest(format!("unreadable field {}: {}", name, e)))?;
        *slot = Some(value);
    }

    Ok(form)
}

#[instrument(skip(state, multipart))]
pub async fn analyze_opg(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalysisResponse>, PipelineError> {
    let started = Instant::now();

    let result = async {
        state.pipeline.ensure_available()?;
        let multipart =
            multipart.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;
        let form = read_form(multipart).await?;
        let request = AnalysisRequest::parse(form.image_url.as_deref(), form.user_id.as_deref())?;
        state.pipeline.analyze(request).await
    }
    .await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(response) => {
            tracing::info!(
                "Analysis succeeded in {}ms with {} detections",
                elapsed_ms,
                response.detections.len()
            );
            state.metrics.record_analysis("success", elapsed_ms);
        }
        Err(e) => {
            tracing::error!("Analysis failed in {}ms: {}", elapsed_ms, e);
            state.metrics.record_analysis(e.category(), elapsed_ms);
        }
    }

    result.map(Json)
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, DownloadConfig, LogLevel, ServerConfig};
    use crate::inference::tests::sh_program;
    use crate::pipeline::AnalysisPipeline;
    use crate::server::HttpServer;
    use crate::staging::tests::{spawn_counting_object_store, spawn_object_store, TestDir};
    use reqwest::{multipart::Form, StatusCode};
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    const JPEG: &[u8] = b"\xff\xd8\xff\xe0xray";

    async fn spawn_app(dir: &TestDir, script: &str, enabled: bool) -> (String, broadcast::Sender<()>) {
        let mut pipeline = sh_program(dir, script, 10);
        pipeline.enabled = enabled;
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                body_limit_bytes: 64 * 1024,
            },
            log_level: LogLevel::Debug,
            pipeline,
            download: DownloadConfig::default(),
        };

        let analysis = AnalysisPipeline::new(&config.pipeline, &config.download).unwrap();
        let server = HttpServer::new(Arc::new(analysis), &config).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        server.run(shutdown_rx).await.unwrap();

        (format!("http://{}", addr), shutdown_tx)
    }

    async fn post_form(app: &str, form: Form) -> (StatusCode, Value) {
        let response = reqwest::Client::new()
            .post(format!("{}/api/analyze-opg", app))
            .multipart(form)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_analyze_opg_success() {
        let (store, hits) = spawn_counting_object_store(JPEG).await;
        let dir = TestDir::new();
        let script = "cp \"$2\" \"$4\"\n\
            echo '{\"detections\":[{\"label\":\"caries\",\"confidence\":0.91,\"bbox\":[10,20,30,40]}]}'\n";
        let (app, _shutdown) = spawn_app(&dir, script, true).await;

        let form = Form::new()
            .text("imageUrl", format!("{}/image.jpg", store))
            .text("userId", "u1");
        let (status, body) = post_form(&app, form).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["annotatedImage"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        assert_eq!(body["detections"][0]["label"], "caries");
        assert_eq!(body["detections"][0]["bbox"], serde_json::json!([10.0, 20.0, 30.0, 40.0]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_analyze_opg_missing_field_is_bad_request() {
        let (store, hits) = spawn_counting_object_store(JPEG).await;
        let dir = TestDir::new();
        let marker = dir.path().join("launched");
        let (app, _shutdown) = spawn_app(&dir, &format!("touch {}\n", marker.display()), true).await;

        let form = Form::new().text("imageUrl", format!("{}/image.jpg", store));
        let (status, body) = post_form(&app, form).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("userId"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("scratch").exists());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_analyze_opg_failure_is_json_500() {
        let store = spawn_object_store(JPEG).await;
        let dir = TestDir::new();
        let (app, _shutdown) = spawn_app(&dir, "exit 7\n", true).await;

        let form = Form::new()
            .text("imageUrl", format!("{}/image.jpg", store))
            .text("userId", "u1");
        let (status, body) = post_form(&app, form).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("exit code 7"));
        assert!(body.get("success").is_none());
    }

    #[tokio::test]
    async fn test_analyze_opg_disabled_is_unavailable() {
        let dir = TestDir::new();
        let (app, _shutdown) = spawn_app(&dir, "", false).await;

        let form = Form::new()
            .text("imageUrl", "https://store/img123.jpg")
            .text("userId", "u1");
        let (status, body) = post_form(&app, form).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let dir = TestDir::new();
        let (app, _shutdown) = spawn_app(&dir, "", true).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{}/health", app))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "Available");

        let form = Form::new().text("userId", "u1");
        post_form(&app, form).await;

        let metrics = client
            .get(format!("{}/metrics", app))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("analysis_requests_total"));
    }
}
