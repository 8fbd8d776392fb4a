//! Stable Fast 3D backend
//!
//! Talks to a local ComfyUI render server with the StableFast3D nodes
//! installed: upload the reference image, queue a three-node workflow,
//! poll the prompt history, then fetch the GLB from the outputs.
//! Image-to-3D only.

use super::http;
use crate::backend::*;
use crate::config::KilnConfig;
use base64::Engine as _;
use kiln_cache::GenerationParams;
use kiln_core::{KilnError, Result};
use std::time::{Duration, Instant};

const DEFAULT_SF3D_URL: &str = "http://127.0.0.1:8189";
const PROBE_TIMEOUT_SECS: u64 = 5;
const REQUIRED_NODES: [&str; 3] = [
    "StableFast3DLoader",
    "StableFast3DSampler",
    "StableFast3DSave",
];

/// Where a finished workflow left its model
#[derive(Debug, PartialEq)]
enum GlbSource {
    File {
        filename: String,
        subfolder: String,
        kind: String,
    },
    Inline(Vec<u8>),
}

/// SF3D backend backed by a local ComfyUI server
pub struct Sf3dBackend {
    server_url: String,
    client_id: String,
}

impl Sf3dBackend {
    pub fn from_config(config: &KilnConfig) -> Result<Self> {
        let server_url = config
            .api_url("sf3d")
            .unwrap_or(DEFAULT_SF3D_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self::new(server_url))
    }

    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    async fn upload_image(&self, image: &[u8], asset_name: &str) -> Result<String> {
        let format = image::guess_format(image).ok();
        let extension = format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("png");
        let mime = format.map(|f| f.to_mime_type()).unwrap_or("image/png");
        let filename = format!("kiln_{}_{}.{}", asset_name, &self.client_id[..8], extension);

        let (boundary, body) =
            http::multipart_body("image", &filename, mime, image, &[("overwrite", "true")]);
        let url = format!("{}/upload/image", self.server_url);
        let response =
            http::blocking(move || http::post_multipart("SF3D", &url, &boundary, &body)).await?;

        Ok(response
            .get("name")
            .and_then(|n| n.as_str())
            .map(|s| s.to_string())
            .unwrap_or(filename))
    }

    async fn queue_prompt(&self, workflow: serde_json::Value) -> Result<String> {
        let payload = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });
        let url = format!("{}/prompt", self.server_url);
        let response =
            http::blocking(move || http::post_json_with_retry("SF3D", &url, None, &payload))
                .await?;

        response
            .get("prompt_id")
            .and_then(|p| p.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                KilnError::Generation(format!("Unexpected SF3D queue response: {}", response))
            })
    }

    /// Poll history until the prompt finishes; transient poll errors are retried
    async fn wait_for_outputs(
        &self,
        prompt_id: &str,
        poll_interval: Duration,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/history/{}", self.server_url, prompt_id);
        loop {
            tokio::time::sleep(poll_interval).await;

            let poll_url = url.clone();
            let history =
                match http::blocking(move || http::get_json_with_retry("SF3D", &poll_url, None))
                    .await
                {
                    Ok(history) => history,
                    Err(e) => {
                        tracing::warn!(backend = "sf3d", prompt_id, error = %e, "History poll failed");
                        continue;
                    }
                };

            let Some(entry) = history.get(prompt_id) else {
                continue;
            };

            let status = entry.get("status");
            if status.and_then(|s| s.get("status_str")).and_then(|s| s.as_str()) == Some("error")
            {
                return Err(KilnError::Generation(format!(
                    "SF3D workflow {} reported an error",
                    prompt_id
                )));
            }

            let completed = status
                .and_then(|s| s.get("completed"))
                .and_then(|c| c.as_bool())
                .unwrap_or(false);
            let has_outputs = entry
                .get("outputs")
                .and_then(|o| o.as_object())
                .is_some_and(|o| !o.is_empty());

            if completed || has_outputs {
                return Ok(entry.get("outputs").cloned().unwrap_or_default());
            }
        }
    }

    async fn fetch_glb(&self, source: GlbSource) -> Result<Vec<u8>> {
        match source {
            GlbSource::Inline(bytes) => Ok(bytes),
            GlbSource::File {
                filename,
                subfolder,
                kind,
            } => {
                let url = format!("{}/view", self.server_url);
                http::blocking(move || {
                    http::download_bytes_with_retry(
                        &url,
                        &[
                            ("filename", filename.as_str()),
                            ("subfolder", subfolder.as_str()),
                            ("type", kind.as_str()),
                        ],
                    )
                })
                .await
            }
        }
    }
}

fn build_workflow(image_name: &str, params: &GenerationParams, prefix: &str) -> serde_json::Value {
    let foreground_ratio = params.get_f64("foreground_ratio").unwrap_or(0.85);
    let texture_resolution = params.get_i64("texture_resolution").unwrap_or(1024);
    let remesh = params.get_str("remesh").unwrap_or("triangle");
    let vertex_count = params.get_i64("vertex_count").unwrap_or(-1);

    serde_json::json!({
        "1": {
            "class_type": "LoadImage",
            "inputs": { "image": image_name, "upload": "image" }
        },
        "2": {
            "class_type": "StableFast3DLoader",
            "inputs": {}
        },
        "8": {
            "class_type": "StableFast3DSampler",
            "inputs": {
                "model": ["2", 0],
                "image": ["1", 0],
                "mask": ["1", 1],
                "foreground_ratio": foreground_ratio,
                "texture_resolution": texture_resolution,
                "remesh": remesh,
                "vertex_count": vertex_count
            }
        },
        "9": {
            "class_type": "StableFast3DSave",
            "inputs": { "mesh": ["8", 0], "filename_prefix": prefix }
        }
    })
}

/// First GLB referenced by the workflow outputs
fn find_glb(outputs: &serde_json::Value) -> Result<GlbSource> {
    let nodes = outputs.as_object().into_iter().flat_map(|o| o.values());
    for node in nodes {
        if let Some(files) = node.get("files").and_then(|f| f.as_array()) {
            for file in files {
                let filename = file.get("filename").and_then(|f| f.as_str()).unwrap_or("");
                if filename.to_ascii_lowercase().ends_with(".glb") {
                    let field = |name: &str, default: &str| {
                        file.get(name)
                            .and_then(|v| v.as_str())
                            .unwrap_or(default)
                            .to_string()
                    };
                    return Ok(GlbSource::File {
                        filename: filename.to_string(),
                        subfolder: field("subfolder", ""),
                        kind: field("type", "output"),
                    });
                }
            }
        }

        if let Some(glbs) = node.get("glbs").and_then(|g| g.as_array()) {
            for encoded in glbs.iter().filter_map(|g| g.as_str()) {
                let data = encoded
                    .strip_prefix("data:application/octet-stream;base64,")
                    .unwrap_or(encoded);
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| KilnError::Generation(format!("Invalid inline GLB: {}", e)))?;
                return Ok(GlbSource::Inline(bytes));
            }
        }
    }

    Err(KilnError::Generation(
        "No GLB files generated by SF3D workflow".to_string(),
    ))
}

fn has_required_nodes(object_info: &serde_json::Value) -> std::result::Result<(), String> {
    let missing: Vec<&str> = REQUIRED_NODES
        .iter()
        .copied()
        .filter(|n| object_info.get(n).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("Missing SF3D nodes: {}", missing.join(", ")))
    }
}

impl GenerationBackend for Sf3dBackend {
    fn name(&self) -> &str {
        "sf3d"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            image_to_3d: true,
            text_to_3d: false,
            formats: vec!["glb".to_string()],
        }
    }

    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let url = format!("{}/object_info", self.server_url);
            let result = http::blocking(move || {
                let agent = http::build_agent(Duration::from_secs(PROBE_TIMEOUT_SECS));
                let mut response = agent.get(&url).call().map_err(|e| {
                    KilnError::BackendUnavailable(format!("SF3D server unreachable: {}", e))
                })?;
                let info: serde_json::Value = response.body_mut().read_json().map_err(|e| {
                    KilnError::BackendUnavailable(format!("Bad object_info response: {}", e))
                })?;
                has_required_nodes(&info).map_err(KilnError::BackendUnavailable)
            })
            .await;

            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(backend = "sf3d", error = %e, "Probe failed");
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
            let start = Instant::now();

            let uploaded = self.upload_image(image, &ctx.asset_name).await?;
            let prefix = format!("kiln/{}", ctx.asset_name);
            let prompt_id = self
                .queue_prompt(build_workflow(&uploaded, params, &prefix))
                .await?;
            tracing::info!(backend = "sf3d", prompt_id = %prompt_id, "Queued workflow");

            let outputs = self.wait_for_outputs(&prompt_id, ctx.poll_interval).await?;
            let bytes = self.fetch_glb(find_glb(&outputs)?).await?;

            let output_path = ctx.artifact_path();
            tokio::fs::create_dir_all(&ctx.output_dir).await?;
            tokio::fs::write(&output_path, &bytes).await?;

            Ok(BackendOutput {
                artifact: Artifact::Path(output_path),
                metadata: BackendMetadata {
                    generation_time_secs: start.elapsed().as_secs_f64(),
                    backend_name: "sf3d".to_string(),
                    external_job_id: Some(prompt_id),
                },
            })
        })
    }

    fn generate_from_prompt<'a>(
        &'a self,
        _prompt: &'a str,
        _params: &'a GenerationParams,
        _ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(async move {
            Err(KilnError::Generation(
                "sf3d does not support text-to-3D generation".to_string(),
            ))
        })
    }
}
