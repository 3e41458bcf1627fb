use super::{
    base::Provider, configs::ProviderConfig, ollama::OllamaProvider, openai::OpenAiProvider,
};
use anyhow::Result;
use strum_macros::{EnumIter, EnumString};

#[derive(EnumIter, EnumString, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Ollama,
}

pub fn get_provider(config: ProviderConfig) -> Result<Box<dyn Provider>> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Ok(Box::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Ollama(ollama_config) => Ok(Box::new(OllamaProvider::new(ollama_config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::configs::OllamaProviderConfig;
    use crate::providers::ollama::{OLLAMA_HOST, OLLAMA_MODEL};
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_provider_type_names() {
        assert_eq!(ProviderType::from_str("openai").ok(), Some(ProviderType::OpenAi));
        assert_eq!(ProviderType::from_str("ollama").ok(), Some(ProviderType::Ollama));
        assert!(ProviderType::from_str("unknown").is_err());
        assert_eq!(ProviderType::iter().count(), 2);
    }

    #[test]
    fn test_get_provider() {
        let config = ProviderConfig::Ollama(OllamaProviderConfig {
            host: OLLAMA_HOST.to_string(),
            model: OLLAMA_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
        });
        assert!(get_provider(config).is_ok());
    }
}
