use async_trait::async_trait;
use serde_json::Value;

/// Rewrites node input before the prompt is built.
#[async_trait]
pub trait InputTransformer: Send + Sync {
    async fn transform(&self, input: &str) -> anyhow::Result<String>;
}

/// Collapses runs of whitespace into single spaces and trims the ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextNormalizer;

#[async_trait]
impl InputTransformer for TextNormalizer {
    async fn transform(&self, input: &str) -> anyhow::Result<String> {
        Ok(input.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// Requires the input to be JSON and re-emits it in canonical compact form.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTransformer;

#[async_trait]
impl InputTransformer for JsonTransformer {
    async fn transform(&self, input: &str) -> anyhow::Result<String> {
        let value: Value = serde_json::from_str(input.trim())
            .map_err(|e| anyhow::anyhow!("input is not valid JSON: {e}"))?;
        Ok(serde_json::to_string(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_normalizer_collapses_whitespace() {
        let out = TextNormalizer.transform("  hello \n\t  world  ").await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_json_transformer() {
        let out = JsonTransformer.transform("{ \"a\" : [1, 2] }").await.unwrap();
        assert_eq!(out, r#"{"a":[1,2]}"#);

        let err = JsonTransformer.transform("not json").await.unwrap_err();
        assert!(err.to_string().starts_with("input is not valid JSON"));
    }
}
