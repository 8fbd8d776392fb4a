//! Meshy 3D model generation backend
//!
//! Image-to-3D goes through the v1 image-to-3d API with the reference
//! image inlined as a data URI; text-to-3D uses the v2 preview mode.
//! Both are long-running remote tasks that are polled at the context's
//! interval until they succeed or fail. The overall bound is the
//! per-attempt timeout applied by the concurrency manager.

use super::http;
use crate::backend::*;
use crate::config::KilnConfig;
use base64::Engine as _;
use kiln_cache::GenerationParams;
use kiln_core::{KilnError, Result};
use std::time::{Duration, Instant};

const DEFAULT_MESHY_URL: &str = "https://api.meshy.ai/openapi";
const PROBE_TIMEOUT_SECS: u64 = 10;

/// Meshy backend for AI 3D model generation
pub struct MeshyBackend {
    api_key: String,
    api_url: String,
}

#[derive(Debug, PartialEq)]
enum MeshyTaskStatus {
    Processing(u8),
    Complete { model_url: Option<String> },
    Failed(String),
}

impl MeshyBackend {
    /// Create a MeshyBackend from config
    pub fn from_config(config: &KilnConfig) -> Result<Self> {
        let api_key = config
            .api_key("meshy")
            .ok_or_else(|| {
                KilnError::BackendUnavailable(
                    "Meshy API key not configured. Set KILN_MESHY_API_KEY or add to .kiln/config.toml"
                        .to_string(),
                )
            })?
            .to_string();

        let api_url = config
            .api_url("meshy")
            .unwrap_or(DEFAULT_MESHY_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self { api_key, api_url })
    }

    fn image_endpoint(&self) -> String {
        format!("{}/v1/image-to-3d", self.api_url)
    }

    fn text_endpoint(&self) -> String {
        format!("{}/v2/text-to-3d", self.api_url)
    }

    /// Submit, poll until terminal, then download the GLB
    async fn run_task(
        &self,
        endpoint: String,
        payload: serde_json::Value,
        ctx: &BackendContext,
    ) -> Result<BackendOutput> {
        let start = Instant::now();

        let key = self.api_key.clone();
        let url = endpoint.clone();
        let response = http::blocking(move || {
            http::post_json_with_retry("Meshy", &url, Some(&key), &payload)
        })
        .await?;
        let task_id = parse_submit(&response)?;
        tracing::info!(backend = "meshy", task_id = %task_id, "Submitted generation task");

        let poll_url = format!("{}/{}", endpoint, task_id);
        let model_url = loop {
            tokio::time::sleep(ctx.poll_interval).await;

            let key = self.api_key.clone();
            let url = poll_url.clone();
            let response =
                http::blocking(move || http::get_json_with_retry("Meshy", &url, Some(&key)))
                    .await?;

            match parse_poll(&response) {
                MeshyTaskStatus::Processing(progress) => {
                    tracing::debug!(backend = "meshy", task_id = %task_id, progress, "Processing");
                }
                MeshyTaskStatus::Complete { model_url } => {
                    break model_url.ok_or_else(|| {
                        KilnError::Generation("No GLB URL in completion response".to_string())
                    })?;
                }
                MeshyTaskStatus::Failed(msg) => {
                    return Err(KilnError::Generation(format!(
                        "Meshy generation failed: {}",
                        msg
                    )));
                }
            }
        };

        let bytes = http::blocking(move || http::download_bytes_with_retry(&model_url, &[])).await?;
        let output_path = ctx.artifact_path();
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        tokio::fs::write(&output_path, &bytes).await?;

        Ok(BackendOutput {
            artifact: Artifact::Path(output_path),
            metadata: BackendMetadata {
                generation_time_secs: start.elapsed().as_secs_f64(),
                backend_name: "meshy".to_string(),
                external_job_id: Some(task_id),
            },
        })
    }
}

fn image_payload(image: &[u8], params: &GenerationParams) -> serde_json::Value {
    let mime = image::guess_format(image)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/png");
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);

    let mut payload = serde_json::json!({
        "image_url": format!("data:{};base64,{}", mime, encoded),
        "enable_pbr": true,
        "should_remesh": true,
        "topology": "triangle"
    });
    if let Some(count) = params.get_i64("vertex_count").filter(|c| *c > 0) {
        payload["target_polycount"] = serde_json::json!(count);
    }
    payload
}

fn prompt_payload(prompt: &str, params: &GenerationParams) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "mode": "preview",
        "prompt": prompt,
        "should_remesh": true
    });
    if let Some(negative) = params.get_str("negative_prompt") {
        payload["negative_prompt"] = serde_json::json!(negative);
    }
    if let Some(count) = params.get_i64("vertex_count").filter(|c| *c > 0) {
        payload["target_polycount"] = serde_json::json!(count);
    }
    payload
}

fn parse_submit(response: &serde_json::Value) -> Result<String> {
    response
        .get("result")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            KilnError::Generation(format!("Unexpected Meshy submit response: {}", response))
        })
}

fn parse_poll(response: &serde_json::Value) -> MeshyTaskStatus {
    let status = response
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("UNKNOWN");

    let progress = response
        .get("progress")
        .and_then(|p| p.as_u64())
        .unwrap_or(0)
        .min(100) as u8;

    match status {
        "SUCCEEDED" => MeshyTaskStatus::Complete {
            model_url: response
                .get("model_urls")
                .and_then(|u| u.get("glb"))
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        },
        "FAILED" | "EXPIRED" | "CANCELED" => MeshyTaskStatus::Failed(
            response
                .get("task_error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .unwrap_or(status)
                .to_string(),
        ),
        _ => MeshyTaskStatus::Processing(progress),
    }
}

impl GenerationBackend for MeshyBackend {
    fn name(&self) -> &str {
        "meshy"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            image_to_3d: true,
            text_to_3d: true,
            formats: vec!["glb".to_string()],
        }
    }

    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if self.api_key.is_empty() {
                return false;
            }
            let key = self.api_key.clone();
            let url = format!("{}?page_size=1", self.text_endpoint());
            let result = http::blocking(move || {
                let agent = http::build_agent(Duration::from_secs(PROBE_TIMEOUT_SECS));
                agent
                    .get(&url)
                    .header("Authorization", &format!("Bearer {}", key))
                    .call()
                    .map(|_| ())
                    .map_err(|e| KilnError::BackendUnavailable(format!("Meshy probe failed: {}", e)))
            })
            .await;

            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(backend = "meshy", error = %e, "Probe failed");
                    false
                }
            }
        })
    }

    fn generate_from_image<'a>(
        &'a self,
        image: &'a [u8],
        params: &'a GenerationParams,
        ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(async move {
            let payload = image_payload(image, params);
            self.run_task(self.image_endpoint(), payload, ctx).await
        })
    }

    fn generate_from_prompt<'a>(
        &'a self,
        prompt: &'a str,
        params: &'a GenerationParams,
        ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(async move {
            let payload = prompt_payload(prompt, params);
            self.run_task(self.text_endpoint(), payload, ctx).await
        })
    }
}
