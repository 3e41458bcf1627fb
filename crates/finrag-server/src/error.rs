use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid configuration value for {env_var}: {message}")]
    InvalidValue { env_var: String, message: String },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Name of the environment variable that sets a configuration field
///
/// Dotted paths map directly. A bare field name comes from a serde "missing field"
/// message, which only the provider section can produce; a missing provider section
/// is reported as its `type`.
pub fn to_env_var(field_path: &str) -> String {
    let normalized_path = match field_path {
        "provider" => "provider.type".to_string(),
        path if path.contains('.') => path.to_string(),
        field => format!("provider.{}", field),
    };

    format!("FINRAG_{}", normalized_path.replace('.', "__").to_uppercase())
}
