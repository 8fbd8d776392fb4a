//! Blocking HTTP helpers shared by remote backends
//!
//! Every function here blocks; async callers go through [`blocking`].

use kiln_core::{KilnError, Result};
use std::time::Duration;

pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 60;
const MAX_RETRIES: usize = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Run blocking work on the worker pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Generation(format!("Worker task failed: {}", e)))?
}

pub(crate) fn build_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    config.into()
}

fn is_retryable_error(e: &ureq::Error) -> bool {
    match e {
        ureq::Error::Timeout(_)
        | ureq::Error::Io(_)
        | ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound => true,
        ureq::Error::StatusCode(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
        _ => false,
    }
}

fn sleep_backoff(attempt: usize) {
    let delay_ms = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt);
    std::thread::sleep(Duration::from_millis(delay_ms));
}

pub(crate) fn post_json_with_retry(
    service: &str,
    url: &str,
    bearer: Option<&str>,
    payload: &serde_json::Value,
) -> Result<serde_json::Value> {
    for attempt in 0..MAX_RETRIES {
        let agent = build_agent(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        let mut request = agent.post(url).header("Content-Type", "application/json");
        if let Some(token) = bearer {
            request = request.header("Authorization", &format!("Bearer {}", token));
        }

        match request.send_json(payload) {
            Ok(mut ok) => {
                return ok.body_mut().read_json().map_err(|e| {
                    KilnError::Generation(format!("Failed to parse {} response: {}", service, e))
                });
            }
            Err(e) => {
                if attempt + 1 < MAX_RETRIES && is_retryable_error(&e) {
                    sleep_backoff(attempt);
                    continue;
                }
                return Err(KilnError::Generation(format!(
                    "{} request failed: {}",
                    service, e
                )));
            }
        }
    }

    Err(KilnError::Generation(format!(
        "{} request failed after retries",
        service
    )))
}

pub(crate) fn get_json_with_retry(
    service: &str,
    url: &str,
    bearer: Option<&str>,
) -> Result<serde_json::Value> {
    for attempt in 0..MAX_RETRIES {
        let agent = build_agent(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        let mut request = agent.get(url);
        if let Some(token) = bearer {
            request = request.header("Authorization", &format!("Bearer {}", token));
        }

        match request.call() {
            Ok(mut ok) => {
                return ok.body_mut().read_json().map_err(|e| {
                    KilnError::Generation(format!("Failed to parse {} poll response: {}", service, e))
                });
            }
            Err(e) => {
                if attempt + 1 < MAX_RETRIES && is_retryable_error(&e) {
                    sleep_backoff(attempt);
                    continue;
                }
                return Err(KilnError::Generation(format!("{} poll failed: {}", service, e)));
            }
        }
    }

    Err(KilnError::Generation(format!(
        "{} poll failed after retries",
        service
    )))
}

pub(crate) fn download_bytes_with_retry(url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>> {
    for attempt in 0..MAX_RETRIES {
        let agent = build_agent(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        let mut request = agent.get(url);
        for (k, v) in query {
            request = request.query(*k, *v);
        }

        match request.call() {
            Ok(ok) => {
                let mut reader = ok.into_body().into_reader();
                let mut bytes = Vec::new();
                std::io::Read::read_to_end(&mut reader, &mut bytes).map_err(|e| {
                    KilnError::Generation(format!("Failed to read model data: {}", e))
                })?;
                return Ok(bytes);
            }
            Err(e) => {
                if attempt + 1 < MAX_RETRIES && is_retryable_error(&e) {
                    sleep_backoff(attempt);
                    continue;
                }
                return Err(KilnError::Generation(format!(
                    "Failed to download model: {}",
                    e
                )));
            }
        }
    }

    Err(KilnError::Generation(
        "Model download failed after retries".to_string(),
    ))
}

/// Single-file `multipart/form-data` body plus its boundary
pub(crate) fn multipart_body(
    field: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
    extra_fields: &[(&str, &str)],
) -> (String, Vec<u8>) {
    let boundary = format!("----kiln{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::with_capacity(data.len() + 512);

    for (name, value) in extra_fields {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    (boundary, body)
}

pub(crate) fn post_multipart(
    service: &str,
    url: &str,
    boundary: &str,
    body: &[u8],
) -> Result<serde_json::Value> {
    let agent = build_agent(Duration::from_secs(REQUEST_TIMEOUT_SECS));
    let mut response = agent
        .post(url)
        .header(
            "Content-Type",
            &format!("multipart/form-data; boundary={}", boundary),
        )
        .send(body)
        .map_err(|e| KilnError::Generation(format!("{} upload failed: {}", service, e)))?;
    response.body_mut().read_json().map_err(|e| {
        KilnError::Generation(format!("Failed to parse {} upload response: {}", service, e))
    })
}
