use anyhow::{Context, Result};
use modelkit::core::options::parse_option;
use modelkit::{model, BiasSet, GenerateOptions, ModelOptions, StreamEvent};
use std::io::{self, Write};

pub fn parse_options(pairs: &[String]) -> Result<ModelOptions> {
    let mut options = ModelOptions::new();
    for pair in pairs {
        let (key, value) = parse_option(pair).with_context(|| format!("invalid option '{pair}'"))?;
        options.insert(key, value);
    }
    Ok(options)
}

/// Parses `token_id=bias` pairs.
pub fn parse_bias(pairs: &[String]) -> Result<BiasSet> {
    let mut bias = BiasSet::new();
    for pair in pairs {
        let (token, value) = pair
            .split_once('=')
            .with_context(|| format!("bias '{pair}' is not of the form token_id=value"))?;
        bias.insert(token.trim().parse()?, value.trim().parse()?);
    }
    Ok(bias)
}

pub async fn resolve(name: &str, options: &[String]) -> Result<()> {
    let llm = model(name, parse_options(options)?)?;
    println!("{llm}");
    println!("  adapter:  {}", llm.adapter().kind());
    println!("  model:    {}", llm.adapter().model_name());
    if let Some(endpoint) = llm.adapter().endpoint() {
        println!("  endpoint: {endpoint}");
    }
    let forwarded = llm.adapter().options().render();
    if !forwarded.is_empty() {
        println!("  options:  {forwarded}");
    }
    for warning in llm.warnings() {
        eprintln!("Warning: {warning}");
    }
    Ok(())
}

pub async fn generate(
    name: &str,
    prompt: &str,
    max_tokens: usize,
    temperature: f64,
    bias: &[String],
    options: &[String],
) -> Result<()> {
    let llm = model(name, parse_options(options)?)?;
    let tokenizer = llm.adapter().tokenizer()?;
    let eos = tokenizer.eos_token();

    let streamer = move |event: &StreamEvent<'_>| {
        if event.batch_index != 0 {
            return;
        }
        if let Some(&token) = event.sequence.last() {
            if token == eos {
                return;
            }
            if let Ok(text) = tokenizer.decode(&[token]) {
                print!("{text}");
                if let Err(e) = io::stdout().flush() {
                    tracing::debug!("stdout flush failed: {e}");
                }
            }
        }
    };

    let generate_options = GenerateOptions::default()
        .max_tokens(max_tokens)
        .temperature(temperature)
        .bias(parse_bias(bias)?);
    llm.generate_streaming(prompt, generate_options, Box::new(streamer)).await?;
    println!();
    Ok(())
}

pub async fn score(name: &str, prompt: &str, values: &[String], options: &[String]) -> Result<()> {
    let llm = model(name, parse_options(options)?)?;
    let result = llm.score(prompt, values).await?;
    for (value, logprob) in result.values.iter().zip(result.logprobs()) {
        println!("{logprob:>10.4}  {value:?}");
    }
    if let Some(best) = result.argmax() {
        println!("argmax: {best:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = parse_options(&["cuda=true".into(), "tokenizer=gpt2".into()]).unwrap();
        assert_eq!(options.render(), "cuda=true, tokenizer=gpt2");
        assert!(parse_options(&["novalue".into()]).is_err());
    }

    #[test]
    fn test_parse_bias() {
        let bias = parse_bias(&["42=100".into(), "7=-2.5".into()]).unwrap();
        assert_eq!(bias.get(42), Some(100.0));
        assert_eq!(bias.get(7), Some(-2.5));
        assert!(parse_bias(&["x=1".into()]).is_err());
    }
}
