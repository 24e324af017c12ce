//! JSON-over-HTTP client for a model served out of process.
//!
//! `POST /score` takes `{model, input_ids, attention_mask, model_args}` and
//! returns `{scores}`. `POST /generate` additionally takes the decoding
//! parameters and returns `{sequences, scores}` where `scores[step][row]` is a
//! full vocabulary distribution.

use super::replay_steps;
use crate::core::generation::check_shape;
use crate::core::{
    GenerationBackend, GenerationRequest, GenerationResult, ModelError, ModelOptions, Result, TokenId,
    Tokenizer, TokenStreamer,
};
use crate::envconfig::Endpoint;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub struct RemoteBackend {
    model: String,
    base_url: Url,
    model_args: ModelOptions,
    client: reqwest::blocking::Client,
    tokenizer: Arc<dyn Tokenizer>,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    model: &'a str,
    input_ids: &'a [Vec<TokenId>],
    attention_mask: &'a [Vec<u32>],
    model_args: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    input_ids: &'a [Vec<TokenId>],
    attention_mask: &'a [Vec<u32>],
    temperature: f64,
    max_new_tokens: usize,
    logit_bias: BTreeMap<String, f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    model_args: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    sequences: Vec<Vec<TokenId>>,
    #[serde(default)]
    scores: Vec<Vec<Vec<f32>>>,
}

impl RemoteBackend {
    pub fn new(
        model: impl Into<String>,
        endpoint: &str,
        model_args: ModelOptions,
        tokenizer: Arc<dyn Tokenizer>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(&Endpoint::parse(endpoint)?.base_url())?;
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model: model.into(),
            base_url,
            model_args,
            client,
            tokenizer,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn post<B: Serialize, R: for<'de> Deserialize<'de>>(&self, route: &str, body: &B) -> Result<R> {
        let url = self
            .base_url
            .join(route)
            .map_err(|e| ModelError::Protocol(format!("bad route {route}: {e}")))?;
        tracing::debug!(model = %self.model, "POST {url}");

        let response = self.client.post(url).json(body).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Protocol(format!("{route} failed ({status}): {body}")));
        }
        Ok(response.json()?)
    }
}

impl GenerationBackend for RemoteBackend {
    fn eos_token_id(&self) -> TokenId {
        self.tokenizer.eos_token()
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    fn score(&self, input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        check_shape(input_ids, attention_mask)?;
        let response: ScoreResponse = self.post(
            "score",
            &ScoreRequest {
                model: &self.model,
                input_ids,
                attention_mask,
                model_args: self.model_args.as_map(),
            },
        )?;

        let shape_ok = response.scores.len() == input_ids.len()
            && response.scores.iter().zip(input_ids).all(|(s, ids)| s.len() == ids.len());
        if !shape_ok {
            return Err(ModelError::Protocol("score shape does not match input_ids".to_string()));
        }
        Ok(response.scores)
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<GenerationResult> {
        request.validate()?;
        let response: GenerateResponse = self.post(
            "generate",
            &GenerateRequest {
                model: &self.model,
                input_ids: &request.input_ids,
                attention_mask: &request.attention_mask,
                temperature: request.temperature,
                max_new_tokens: request.max_new_tokens,
                logit_bias: request.bias.iter().map(|(id, b)| (id.to_string(), b)).collect(),
                seed: request.seed,
                model_args: self.model_args.as_map(),
            },
        )?;

        let prompt_width = request.seq_len();
        if response.sequences.len() != request.batch_size()
            || response.sequences.iter().any(|s| s.len() < prompt_width)
        {
            return Err(ModelError::Protocol("generated sequences do not extend the prompt".to_string()));
        }

        let vocab = self.vocab_size();
        let mut scores = Vec::with_capacity(response.scores.len());
        for (step, rows) in response.scores.into_iter().enumerate() {
            if rows.len() != request.batch_size() || rows.iter().any(|r| r.len() != vocab) {
                return Err(ModelError::Protocol(format!("step {step} scores have the wrong shape")));
            }
            let flat: Vec<f32> = rows.into_iter().flatten().collect();
            scores.push(Tensor::from_vec(flat, (request.batch_size(), vocab), &Device::Cpu)?);
        }

        let result = GenerationResult {
            sequences: response.sequences,
            scores,
        };
        if let Some(streamer) = streamer {
            replay_steps(&result, prompt_width, streamer)?;
        }
        Ok(result)
    }
}
