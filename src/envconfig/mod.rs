use std::env;

pub const DEFAULT_MODEL_VAR: &str = "MODELKIT_DEFAULT_MODEL";
pub const BROWSER_VAR: &str = "MODELKIT_BROWSER";
pub const ENDPOINT_VAR: &str = "MODELKIT_ENDPOINT";

pub const NATIVE_DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo-instruct";
/// Browser builds cannot load the 3.5 tokenizers.
pub const BROWSER_DEFAULT_MODEL: &str = "openai/text-davinci-003";

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_REMOTE_ENDPOINT: &str = "localhost:8080";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub default_model: Option<String>,
    pub browser: bool,
    pub remote_endpoint: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub timeout: u64,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            default_model: non_empty(DEFAULT_MODEL_VAR),
            browser: cfg!(target_arch = "wasm32") || env::var_os(BROWSER_VAR).is_some(),
            remote_endpoint: non_empty(ENDPOINT_VAR)
                .unwrap_or_else(|| DEFAULT_REMOTE_ENDPOINT.to_string()),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_api_base: non_empty("OPENAI_API_BASE").unwrap_or_else(|| DEFAULT_OPENAI_BASE.to_string()),
            timeout: env::var("MODELKIT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Explicit override first, then the fallback for the runtime context.
    pub fn initial_default_model(&self) -> String {
        match &self.default_model {
            Some(model) => model.clone(),
            None if self.browser => BROWSER_DEFAULT_MODEL.to_string(),
            None => NATIVE_DEFAULT_MODEL.to_string(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// A `host:port` pair, optionally written with an `http://` or `https://` scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = url::Url::parse(&with_scheme)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("endpoint '{raw}' has no host"))?
            .to_string();
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
        })
    }

    pub fn base_url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(default_model: Option<&str>, browser: bool) -> EnvConfig {
        EnvConfig {
            default_model: default_model.map(String::from),
            browser,
            remote_endpoint: DEFAULT_REMOTE_ENDPOINT.to_string(),
            openai_api_key: None,
            openai_api_base: DEFAULT_OPENAI_BASE.to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }

    #[test]
    fn test_initial_default_model() {
        assert_eq!(config(None, false).initial_default_model(), NATIVE_DEFAULT_MODEL);
        assert_eq!(config(None, true).initial_default_model(), BROWSER_DEFAULT_MODEL);
        assert_eq!(config(Some("local:gpt2"), true).initial_default_model(), "local:gpt2");
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("localhost:8080").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, Some(8080));
        assert_eq!(endpoint.base_url(), "http://localhost:8080");

        let endpoint = Endpoint::parse("https://api.example.com").unwrap();
        assert_eq!(endpoint.base_url(), "https://api.example.com");
    }
}
