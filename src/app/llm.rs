use super::adapter::ModelAdapter;
use super::resolver::{ModelDescriptor, Resolver};
use crate::core::{
    BiasSet, GenerationRequest, ModelError, ModelOptions, ResolutionWarning, Result, TokenId, TokenStreamer,
};
use std::future::Future;
use std::sync::Arc;

pub const DEFAULT_MAX_TOKENS: usize = 128;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f64,
    pub bias: BiasSet,
    pub seed: Option<u64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            bias: BiasSet::new(),
            seed: None,
        }
    }
}

impl GenerateOptions {
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn bias(mut self, bias: BiasSet) -> Self {
        self.bias = bias;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Log-probabilities of each candidate continuation given a shared prompt.
#[derive(Debug, Clone)]
pub struct ScoringResult {
    pub prompt: String,
    pub values: Vec<String>,
    /// Per value, the log-probability of each of its tokens.
    pub token_logprobs: Vec<Vec<f32>>,
}

impl ScoringResult {
    pub fn logprobs(&self) -> Vec<f32> {
        self.token_logprobs.iter().map(|t| t.iter().sum()).collect()
    }

    pub fn argmax(&self) -> Option<&str> {
        self.logprobs()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.values[i].as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A resolved model. Handles are shared as `Arc<Llm>`; the adapter behind one
/// builds its backend on first use.
pub struct Llm {
    model_identifier: String,
    configuration_string: String,
    adapter: Arc<dyn ModelAdapter>,
    warnings: Vec<ResolutionWarning>,
}

impl Llm {
    pub fn new(
        model_identifier: impl Into<String>,
        configuration_string: impl Into<String>,
        adapter: Arc<dyn ModelAdapter>,
    ) -> Self {
        Self {
            model_identifier: model_identifier.into(),
            configuration_string: configuration_string.into(),
            adapter,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<ResolutionWarning>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn from_descriptor(descriptor: impl Into<ModelDescriptor>, options: ModelOptions) -> Result<Arc<Llm>> {
        Resolver::global().resolve(descriptor, options)
    }

    pub fn model_identifier(&self) -> &str {
        &self.model_identifier
    }

    pub fn configuration_string(&self) -> &str {
        &self.configuration_string
    }

    pub fn adapter(&self) -> &Arc<dyn ModelAdapter> {
        &self.adapter
    }

    pub fn warnings(&self) -> &[ResolutionWarning] {
        &self.warnings
    }

    pub async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<String> {
        self.run_generation(prompt, options, None).await
    }

    /// Like [`Llm::generate`], reporting every decoding step to `streamer`
    /// before the next one starts.
    pub async fn generate_streaming(
        &self,
        prompt: &str,
        options: GenerateOptions,
        streamer: Box<dyn TokenStreamer>,
    ) -> Result<String> {
        self.run_generation(prompt, options, Some(streamer)).await
    }

    async fn run_generation(
        &self,
        prompt: &str,
        options: GenerateOptions,
        mut streamer: Option<Box<dyn TokenStreamer>>,
    ) -> Result<String> {
        let prompt_ids = self.adapter.tokenize(prompt).await?;
        let prompt_len = prompt_ids.len();
        tracing::debug!(model = %self.model_identifier, prompt_len, max_tokens = options.max_tokens, "generate");

        let adapter = Arc::clone(&self.adapter);
        let result = tokio::task::spawn_blocking(move || {
            let backend = adapter.generation_backend()?;
            let mut request = GenerationRequest::left_padded(vec![prompt_ids], backend.eos_token_id())
                .max_new_tokens(options.max_tokens)
                .temperature(options.temperature)
                .bias(options.bias);
            request.seed = options.seed;
            let streamer = streamer.as_mut().map(|s| s.as_mut() as &mut dyn TokenStreamer);
            let result = backend.generate(&request, streamer)?;
            Ok::<_, ModelError>((result, backend.eos_token_id()))
        })
        .await??;

        let (result, eos) = result;
        let new_tokens = result
            .new_tokens(prompt_len)
            .into_iter()
            .next()
            .ok_or(ModelError::EmptyResult)?;
        let completion: Vec<TokenId> = new_tokens.iter().copied().take_while(|t| *t != eos).collect();
        self.adapter.detokenize(&completion).await
    }

    pub async fn score<S: AsRef<str>>(&self, prompt: &str, values: &[S]) -> Result<ScoringResult> {
        if values.is_empty() {
            return Err(ModelError::InvalidRequest("no values to score".to_string()));
        }

        let prompt_ids = self.adapter.tokenize(prompt).await?;
        let mut value_lens = Vec::with_capacity(values.len());
        let mut rows = Vec::with_capacity(values.len());
        for value in values {
            let ids = self.adapter.tokenize(value.as_ref()).await?;
            value_lens.push(ids.len());
            let mut row = prompt_ids.clone();
            row.extend(ids);
            rows.push(row);
        }
        tracing::debug!(model = %self.model_identifier, candidates = rows.len(), "score");

        let adapter = Arc::clone(&self.adapter);
        let scores = tokio::task::spawn_blocking(move || {
            let backend = adapter.generation_backend()?;
            let eos = backend.eos_token_id();
            let width = rows.iter().map(Vec::len).max().unwrap_or(0);
            let mut mask = Vec::with_capacity(rows.len());
            for row in rows.iter_mut() {
                let mut m = vec![1u32; row.len()];
                m.resize(width, 0);
                row.resize(width, eos);
                mask.push(m);
            }
            backend.score(&rows, &mask)
        })
        .await??;

        let prompt_len = prompt_ids.len();
        let token_logprobs = scores
            .iter()
            .zip(&value_lens)
            .map(|(row, len)| row.get(prompt_len..prompt_len + len).unwrap_or(&[]).to_vec())
            .collect();

        Ok(ScoringResult {
            prompt: prompt.to_string(),
            values: values.iter().map(|v| v.as_ref().to_string()).collect(),
            token_logprobs,
        })
    }

    /// Blocking [`Llm::generate`]. Fails with [`ModelError::NestedRuntime`]
    /// when called from inside an async runtime.
    pub fn generate_sync(&self, prompt: &str, options: GenerateOptions) -> Result<String> {
        block_on(self.generate(prompt, options))?
    }

    pub fn score_sync<S: AsRef<str>>(&self, prompt: &str, values: &[S]) -> Result<ScoringResult> {
        block_on(self.score(prompt, values))?
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(ModelError::NestedRuntime);
    }
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    Ok(runtime.block_on(future))
}

impl std::fmt::Display for Llm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Llm({}, {})", self.model_identifier, self.configuration_string)
    }
}

impl std::fmt::Debug for Llm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llm")
            .field("model_identifier", &self.model_identifier)
            .field("configuration_string", &self.configuration_string)
            .field("kind", &self.adapter.kind())
            .field("warnings", &self.warnings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adapter::InProcessAdapter;
    use crate::core::BackendRegistry;

    fn random_llm(seed: u64) -> Llm {
        let options = ModelOptions::new()
            .with("tokenizer", "bytes")
            .with("inprocess", true)
            .with("seed", seed);
        let adapter = InProcessAdapter::new("random", options, Arc::new(BackendRegistry::with_builtins()));
        Llm::new("random", "vocab=bytes", Arc::new(adapter))
    }

    #[test]
    fn test_display() {
        assert_eq!(random_llm(1).to_string(), "Llm(random, vocab=bytes)");
    }

    #[test]
    fn test_scoring_result_argmax() {
        let result = ScoringResult {
            prompt: "p".into(),
            values: vec!["a".into(), "b".into()],
            token_logprobs: vec![vec![-1.0, -2.0], vec![-0.5]],
        };
        assert_eq!(result.logprobs(), vec![-3.0, -0.5]);
        assert_eq!(result.argmax(), Some("b"));
    }

    #[tokio::test]
    async fn test_generate_is_deterministic_for_a_seed() {
        let options = GenerateOptions::default().max_tokens(6);
        let a = random_llm(7).generate("hello", options.clone()).await.unwrap();
        let b = random_llm(7).generate("hello", options).await.unwrap();
        assert_eq!(a, b);
        assert!(a.len() <= 6 * 4);
    }

    #[tokio::test]
    async fn test_score_shapes() {
        let llm = random_llm(3);
        let result = llm.score("The answer is ", &["yes", "no!"]).await.unwrap();
        assert_eq!(result.token_logprobs[0].len(), 3);
        assert_eq!(result.token_logprobs[1].len(), 3);
        assert!(result.logprobs().iter().all(|lp| *lp <= 0.0));
        assert!(result.argmax().is_some());

        let empty: [&str; 0] = [];
        assert!(matches!(llm.score("x", &empty).await, Err(ModelError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_sync_inside_runtime_is_rejected() {
        let llm = random_llm(1);
        assert!(matches!(
            llm.generate_sync("hi", GenerateOptions::default()),
            Err(ModelError::NestedRuntime)
        ));
    }

    #[test]
    fn test_sync_outside_runtime() {
        let llm = random_llm(1);
        let text = llm.generate_sync("hi", GenerateOptions::default().max_tokens(3)).unwrap();
        assert!(text.len() <= 3 * 4);
        let scored = llm.score_sync("hi", &["a"]).unwrap();
        assert_eq!(scored.len(), 1);
    }
}
