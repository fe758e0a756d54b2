//! Application Configuration Module
//!
//! Centralizes configuration for the dialer service: everything is loaded
//! from environment variables into one shareable struct.

use std::env;
use tracing::Level;

/// Where call records land unless `STORE_PATH` says otherwise.
pub const DEFAULT_STORE_PATH: &str = "calls.json";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub gemini_api_key: String,
    pub chat_model: String,
    pub store_path: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `GEMINI_API_KEY`: Your secret key for the Gemini API. Required.
    // *   `CHAT_MODEL`: (Optional) The generation model. Defaults to "gemini-pro".
    // *   `STORE_PATH`: (Optional) Call-record file. Defaults to "calls.json".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. Useful for local development, ignored if absent.
        dotenvy::dotenv().ok();

        let gemini_api_key = env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let chat_model = env::var("CHAT_MODEL").unwrap_or_else(|_| "gemini-pro".to_string());
        let store_path =
            env::var("STORE_PATH").unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string());

        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            gemini_api_key,
            chat_model,
            store_path,
            log_level,
        })
    }
}
