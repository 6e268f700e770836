//! Local LLM runtime client: blocking NDJSON token streaming plus
//! model-family request shaping.
//!
//! The runtime speaks the Ollama-style `/api/generate` contract: one JSON
//! object per line, `response` carrying the token text and `done` closing
//! the stream.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::CoreError;

use super::repetition::DEFAULT_SEED_PHRASES;

/// A stream with no token for this long is considered hung.
pub const TOKEN_IDLE_TIMEOUT_SECS: u64 = 30;

/// Hard token cap applied to the `gpt-oss` family.
pub const GPT_OSS_MAX_TOKENS: u32 = 2048;
const GPT_OSS_TEMPERATURE: f32 = 0.3;
const GPT_OSS_TOP_P: f32 = 0.95;

const GPT_OSS_ANTI_REPEAT_LINE: &str =
    "Do not repeat yourself. State each correction once and move on.";

/// Sampler settings forwarded to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: None,
        }
    }
}

/// One generation request, fully resolved before the worker starts.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub prompt: String,
    pub params: GenerationParams,
}

/// Family check for the reasoning-channel models.
pub fn is_gpt_oss(model_id: &str) -> bool {
    model_id.to_ascii_lowercase().contains("gpt-oss")
}

/// Apply per-family request overrides in place.
///
/// The `gpt-oss` family gets a capped token budget, a conservative
/// sampler, and an anti-repetition instruction appended to the system
/// prompt. Other families pass through unchanged.
pub fn apply_model_overrides(request: &mut LlmRequest) {
    if !is_gpt_oss(&request.model_id) {
        return;
    }
    request.params.temperature = GPT_OSS_TEMPERATURE;
    request.params.top_p = GPT_OSS_TOP_P;
    request.params.max_tokens = Some(
        request
            .params
            .max_tokens
            .map_or(GPT_OSS_MAX_TOKENS, |cap| cap.min(GPT_OSS_MAX_TOKENS)),
    );
    if !request.system_prompt.contains(GPT_OSS_ANTI_REPEAT_LINE) {
        if !request.system_prompt.is_empty() {
            request.system_prompt.push('\n');
        }
        request.system_prompt.push_str(GPT_OSS_ANTI_REPEAT_LINE);
    }
}

/// Loop-detection seeds for a model family.
pub fn seeds_for_model(model_id: &str) -> Vec<String> {
    let mut seeds: Vec<String> = DEFAULT_SEED_PHRASES
        .iter()
        .map(|seed| seed.to_string())
        .collect();
    if is_gpt_oss(model_id) {
        seeds.push("We need to".to_string());
    }
    seeds
}

/// Iterator-style token feed consumed by the streaming engine. Implemented
/// by the HTTP client below and by in-memory stubs in tests.
pub trait TokenSource {
    /// Next token text, `None` at end of stream.
    ///
    /// # Errors
    ///
    /// [`CoreError::Timeout`] when no token arrives within the idle
    /// window, [`CoreError::ModelRuntime`] for transport or decode
    /// failures.
    fn next_token(&mut self) -> Result<Option<String>, CoreError>;
}

/// Blocking HTTP client for the local model runtime.
pub struct LlmClient {
    endpoint: String,
    http: reqwest::blocking::Client,
}

impl LlmClient {
    /// # Errors
    ///
    /// Returns [`CoreError::ModelLoad`] when the HTTP client cannot be
    /// constructed.
    pub fn new(endpoint: &str) -> Result<Self, CoreError> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .read_timeout(Duration::from_secs(TOKEN_IDLE_TIMEOUT_SECS))
            .timeout(None)
            .build()
            .map_err(|err| CoreError::ModelLoad(format!("llm http client: {err}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Open a streaming generation request.
    ///
    /// # Errors
    ///
    /// [`CoreError::ModelLoad`] when the runtime rejects the request or
    /// cannot be reached.
    pub fn stream_generate(&self, request: &LlmRequest) -> Result<NdjsonTokenSource, CoreError> {
        let mut options = json!({
            "temperature": request.params.temperature,
            "top_p": request.params.top_p,
        });
        if let Some(cap) = request.params.max_tokens {
            options["num_predict"] = json!(cap);
        }
        let body = json!({
            "model": request.model_id,
            "system": request.system_prompt,
            "prompt": request.prompt,
            "stream": true,
            "options": options,
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .send()
            .map_err(|err| CoreError::ModelLoad(format!("llm request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelLoad(format!(
                "llm runtime returned {} for model '{}'",
                response.status(),
                request.model_id
            )));
        }
        Ok(NdjsonTokenSource::new(response))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// NDJSON line reader over a streaming HTTP response body.
pub struct NdjsonTokenSource {
    reader: BufReader<Box<dyn Read + Send>>,
    finished: bool,
}

impl NdjsonTokenSource {
    fn new(response: reqwest::blocking::Response) -> Self {
        Self {
            reader: BufReader::new(Box::new(response)),
            finished: false,
        }
    }

    #[cfg(test)]
    fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: BufReader::new(reader),
            finished: false,
        }
    }
}

impl TokenSource for NdjsonTokenSource {
    fn next_token(&mut self) -> Result<Option<String>, CoreError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock
                {
                    CoreError::Timeout("llm token idle".to_string())
                } else {
                    CoreError::ModelRuntime(format!("llm stream read: {err}"))
                }
            })?;
            if read == 0 {
                self.finished = true;
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let chunk: GenerateChunk = serde_json::from_str(trimmed)
                .map_err(|err| CoreError::ModelRuntime(format!("llm stream decode: {err}")))?;
            if chunk.done {
                self.finished = true;
                if chunk.response.is_empty() {
                    return Ok(None);
                }
            }
            return Ok(Some(chunk.response));
        }
    }
}
