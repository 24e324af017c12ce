//! Client for OpenAI-compatible `/completions` endpoints.
//!
//! Prompts are sent as token ids so the server sees exactly the sequence the
//! caller built. Scoring echoes the prompt back with `max_tokens = 0` and reads
//! the per-token log-probabilities; generation maps the bias set onto
//! `logit_bias` and reconstructs per-step scores from `top_logprobs`.

use super::{pad_right, replay_steps, unpadded};
use crate::core::generation::check_shape;
use crate::core::{
    GenerationBackend, GenerationRequest, GenerationResult, ModelError, Result, TokenId, Tokenizer,
    TokenStreamer,
};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The API rejects larger `logprobs` values.
const MAX_TOP_LOGPROBS: u32 = 5;

pub struct OpenAiBackend {
    model: String,
    base_url: String,
    api_key: String,
    top_logprobs: u32,
    client: reqwest::blocking::Client,
    tokenizer: Arc<dyn Tokenizer>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: Vec<Vec<TokenId>>,
    max_tokens: usize,
    temperature: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    logit_bias: BTreeMap<String, f32>,
    logprobs: u32,
    echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    index: usize,
    #[serde(default)]
    text: String,
    logprobs: Option<Logprobs>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Logprobs {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    token_logprobs: Vec<Option<f32>>,
    #[serde(default)]
    top_logprobs: Vec<Option<BTreeMap<String, f32>>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl OpenAiBackend {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        tokenizer: Arc<dyn Tokenizer>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            top_logprobs: MAX_TOP_LOGPROBS,
            client,
            tokenizer,
        })
    }

    pub fn with_top_logprobs(mut self, n: u32) -> Self {
        self.top_logprobs = n.min(MAX_TOP_LOGPROBS);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<Vec<Choice>> {
        let url = format!("{}/completions", self.base_url);
        tracing::debug!(model = %self.model, prompts = request.prompt.len(), max_tokens = request.max_tokens, "POST {url}");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ModelError::Protocol(format!("completion request failed ({status}): {message}")));
        }

        let mut choices = response.json::<CompletionResponse>()?.choices;
        if choices.len() != request.prompt.len() {
            return Err(ModelError::Protocol(format!(
                "expected {} choices, got {}",
                request.prompt.len(),
                choices.len()
            )));
        }
        choices.sort_by_key(|c| c.index);
        Ok(choices)
    }

    /// The API reports decoded token text; byte-level vocabularies store it
    /// under a different surface form, so fall back to a single-token encode.
    fn lookup(&self, token: &str) -> Option<TokenId> {
        self.tokenizer.token_to_id(token).or_else(|| match self.tokenizer.encode(token) {
            Ok(ids) if ids.len() == 1 => ids.first().copied(),
            _ => None,
        })
    }

    /// Builds a `[vocab]` row with the reported alternatives, everything else at -inf.
    fn step_row(&self, sampled: Option<(TokenId, f32)>, top: Option<&BTreeMap<String, f32>>) -> Vec<f32> {
        let mut row = vec![f32::NEG_INFINITY; self.tokenizer.vocab_size()];
        if let Some(top) = top {
            for (token, logprob) in top {
                if let Some(id) = self.lookup(token) {
                    if let Some(slot) = row.get_mut(id as usize) {
                        *slot = *logprob;
                    }
                }
            }
        }
        if let Some((id, logprob)) = sampled {
            if let Some(slot) = row.get_mut(id as usize) {
                *slot = logprob;
            }
        }
        row
    }
}

impl GenerationBackend for OpenAiBackend {
    fn eos_token_id(&self) -> TokenId {
        self.tokenizer.eos_token()
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    fn score(&self, input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        check_shape(input_ids, attention_mask)?;
        if input_ids.is_empty() {
            return Ok(Vec::new());
        }

        let request = CompletionRequest {
            model: &self.model,
            prompt: unpadded(input_ids, attention_mask),
            max_tokens: 0,
            temperature: 0.0,
            logit_bias: BTreeMap::new(),
            logprobs: 0,
            echo: true,
            seed: None,
        };
        let choices = self.complete(&request)?;

        let mut scores = Vec::with_capacity(input_ids.len());
        for ((choice, mask), prompt) in choices.iter().zip(attention_mask).zip(&request.prompt) {
            let logprobs = choice.logprobs.as_ref().map(|l| &l.token_logprobs[..]).unwrap_or(&[]);
            if logprobs.len() < prompt.len() {
                return Err(ModelError::Protocol(format!(
                    "echoed {} log-probabilities for a {}-token prompt",
                    logprobs.len(),
                    prompt.len()
                )));
            }

            let mut row = vec![0.0f32; mask.len()];
            let mut echoed = logprobs.iter();
            for (slot, m) in row.iter_mut().zip(mask) {
                if *m != 0 {
                    *slot = echoed.next().copied().flatten().unwrap_or(0.0);
                }
            }
            // The first position is unconditioned even when the row is unpadded.
            if let Some(first) = row.first_mut() {
                *first = 0.0;
            }
            scores.push(row);
        }
        Ok(scores)
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<GenerationResult> {
        request.validate()?;
        let eos = self.eos_token_id();

        let body = CompletionRequest {
            model: &self.model,
            prompt: unpadded(&request.input_ids, &request.attention_mask),
            max_tokens: request.max_new_tokens,
            temperature: request.temperature,
            logit_bias: request.bias.iter().map(|(id, b)| (id.to_string(), b)).collect(),
            logprobs: self.top_logprobs,
            echo: false,
            seed: request.seed,
        };
        let choices = if body.prompt.is_empty() { Vec::new() } else { self.complete(&body)? };

        let mut sequences = Vec::with_capacity(choices.len());
        let mut rows: Vec<Vec<Vec<f32>>> = Vec::with_capacity(choices.len());
        for (choice, prompt) in choices.iter().zip(&request.input_ids) {
            let mut new_ids = self.tokenizer.encode(&choice.text)?;
            new_ids.truncate(request.max_new_tokens);
            if choice.finish_reason.as_deref() == Some("stop") && new_ids.len() < request.max_new_tokens {
                new_ids.push(eos);
            }

            let logprobs = choice.logprobs.as_ref();
            let mut steps = Vec::with_capacity(new_ids.len());
            for (step, id) in new_ids.iter().enumerate() {
                let sampled = logprobs
                    .and_then(|l| l.token_logprobs.get(step).copied().flatten())
                    .map(|lp| (*id, lp));
                let top = logprobs.and_then(|l| l.top_logprobs.get(step)).and_then(Option::as_ref);
                steps.push(self.step_row(sampled, top));
            }
            if let Some(l) = logprobs {
                tracing::trace!(tokens = ?l.tokens, "completion tokens");
            }

            let mut sequence = prompt.clone();
            sequence.extend(new_ids);
            sequences.push(sequence);
            rows.push(steps);
        }
        pad_right(&mut sequences, eos);

        let vocab = self.vocab_size();
        let prompt_width = request.seq_len();
        let steps = sequences.first().map(|s| s.len() - prompt_width).unwrap_or(0);
        let mut scores = Vec::with_capacity(steps);
        for step in 0..steps {
            let mut flat = Vec::with_capacity(rows.len() * vocab);
            for row in &rows {
                match row.get(step) {
                    Some(dist) => flat.extend_from_slice(dist),
                    None => {
                        let mut done = vec![f32::NEG_INFINITY; vocab];
                        if let Some(slot) = done.get_mut(eos as usize) {
                            *slot = 0.0;
                        }
                        flat.extend(done);
                    }
                }
            }
            scores.push(Tensor::from_vec(flat, (rows.len(), vocab), &Device::Cpu)?);
        }

        let result = GenerationResult { sequences, scores };
        if let Some(streamer) = streamer {
            replay_steps(&result, prompt_width, streamer)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::ByteTokenizer;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new(
            "gpt-3.5-turbo-instruct",
            "https://api.openai.com/v1/",
            "sk-test",
            Arc::new(ByteTokenizer::new()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_request_body() {
        let request = CompletionRequest {
            model: "m",
            prompt: vec![vec![1, 2]],
            max_tokens: 4,
            temperature: 0.0,
            logit_bias: [("7".to_string(), 100.0)].into_iter().collect(),
            logprobs: 5,
            echo: false,
            seed: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["prompt"], serde_json::json!([[1, 2]]));
        assert_eq!(value["logit_bias"]["7"], 100.0);
        assert!(value.get("seed").is_none());
    }

    #[test]
    fn test_base_url_trimmed() {
        assert_eq!(backend().base_url, "https://api.openai.com/v1");
        assert_eq!(backend().with_top_logprobs(20).top_logprobs, MAX_TOP_LOGPROBS);
    }

    #[test]
    fn test_step_row() {
        let backend = backend();
        let top: BTreeMap<String, f32> = [("a".to_string(), -0.5), ("b".to_string(), -1.5)].into_iter().collect();
        let row = backend.step_row(Some((b'a' as u32, -0.4)), Some(&top));
        assert_eq!(row.len(), 257);
        assert_eq!(row[b'a' as usize], -0.4);
        assert_eq!(row[b'b' as usize], -1.5);
        assert_eq!(row[b'c' as usize], f32::NEG_INFINITY);
    }

    #[test]
    fn test_choice_parses_nullable_logprobs() {
        let raw = r#"{"choices":[{"index":0,"text":"hi","finish_reason":"stop",
            "logprobs":{"tokens":["h","i"],"token_logprobs":[null,-0.25],"top_logprobs":[null,{"i":-0.25}]}}]}"#;
        let response: CompletionResponse = serde_json::from_str(raw).unwrap();
        let logprobs = response.choices[0].logprobs.as_ref().unwrap();
        assert_eq!(logprobs.token_logprobs, vec![None, Some(-0.25)]);
        assert!(logprobs.top_logprobs[0].is_none());
    }
}
