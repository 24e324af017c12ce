use serde_json::{Map, Value};

/// Keyword configuration passed alongside a model identifier.
///
/// Keys keep their insertion order so the rendered configuration string reads
/// back exactly as the caller wrote it. A `null` value is the same as leaving
/// the key out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOptions {
    values: Map<String, Value>,
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        match value.into() {
            Value::Null => {
                self.values.shift_remove(&key);
            }
            value => {
                self.values.insert(key, value);
            }
        }
    }

    /// Removes `key`, keeping the order of the remaining entries.
    pub fn pop(&mut self, key: &str) -> Option<Value> {
        self.values.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Truthiness: `true`, non-zero numbers and non-empty strings other than "false"/"0".
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(Value::Null) | None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `key=value` pairs joined by `", "`, strings rendered without quotes.
    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ModelOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = ModelOptions::new();
        for (k, v) in iter {
            options.insert(k, v);
        }
        options
    }
}

/// Parses a `key=value` command-line pair. The value is read as JSON when it
/// parses (numbers, booleans) and as a plain string otherwise.
pub fn parse_option(pair: &str) -> anyhow::Result<(String, Value)> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{pair}'"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("empty option name in '{pair}'");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
