use crate::defaults;
use crate::error::{Result, VoicepipeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineSection,
    pub recognition: RecognitionConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub logging: LoggingConfig,
}

/// Queue capacities and shutdown timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub recognition_queue: usize,
    pub generation_queue: usize,
    pub synthesis_queue: usize,
    pub output_queue: usize,
    pub drain_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub end_of_input_grace_ms: u64,
    /// Interrupt the response in progress when the user starts speaking.
    pub barge_in: bool,
}

/// Speech recognition collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognitionConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub language: String,
    pub interim_results: bool,
}

/// Text generation collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub fallback_message: String,
}

/// Speech synthesis collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisConfig {
    pub api_key: Option<String>,
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// One JSON object per line instead of human-readable text.
    pub json: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            recognition_queue: defaults::RECOGNITION_QUEUE,
            generation_queue: defaults::GENERATION_QUEUE,
            synthesis_queue: defaults::SYNTHESIS_QUEUE,
            output_queue: defaults::OUTPUT_QUEUE,
            drain_timeout_ms: defaults::DRAIN_TIMEOUT_MS,
            close_timeout_ms: defaults::CLOSE_TIMEOUT_MS,
            end_of_input_grace_ms: defaults::END_OF_INPUT_GRACE_MS,
            barge_in: true,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: defaults::RECOGNITION_MODEL.to_string(),
            language: defaults::RECOGNITION_LANGUAGE.to_string(),
            interim_results: true,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: defaults::GENERATION_MODEL.to_string(),
            temperature: defaults::GENERATION_TEMPERATURE,
            max_tokens: defaults::GENERATION_MAX_TOKENS,
            system_prompt: defaults::SYSTEM_PROMPT.to_string(),
            fallback_message: defaults::FALLBACK_MESSAGE.to_string(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: defaults::SYNTHESIS_VOICE_ID.to_string(),
            model_id: defaults::SYNTHESIS_MODEL_ID.to_string(),
            stability: defaults::SYNTHESIS_STABILITY,
            similarity_boost: defaults::SYNTHESIS_SIMILARITY_BOOST,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json: true,
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> VoicepipeError {
    VoicepipeError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn in_unit_range(value: f32) -> bool {
    (0.0..=1.0).contains(&value)
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VoicepipeError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                VoicepipeError::Io(e)
            }
        })?;
        Self::parse(&contents)
    }

    /// Parse configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(VoicepipeError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOICEPIPE_RECOGNITION_API_KEY → recognition.api_key
    /// - VOICEPIPE_GENERATION_API_KEY → generation.api_key
    /// - VOICEPIPE_SYNTHESIS_API_KEY → synthesis.api_key
    /// - VOICEPIPE_LOG_LEVEL → logging.level
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("VOICEPIPE_RECOGNITION_API_KEY")
            && !key.is_empty()
        {
            self.recognition.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("VOICEPIPE_GENERATION_API_KEY")
            && !key.is_empty()
        {
            self.generation.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("VOICEPIPE_SYNTHESIS_API_KEY")
            && !key.is_empty()
        {
            self.synthesis.api_key = Some(key);
        }

        if let Ok(level) = std::env::var("VOICEPIPE_LOG_LEVEL")
            && !level.is_empty()
        {
            self.logging.level = level;
        }

        self
    }

    /// Check value ranges. Credentials are checked separately.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        for (key, capacity) in [
            ("pipeline.recognition_queue", p.recognition_queue),
            ("pipeline.generation_queue", p.generation_queue),
            ("pipeline.synthesis_queue", p.synthesis_queue),
            ("pipeline.output_queue", p.output_queue),
        ] {
            if capacity == 0 {
                return Err(invalid(key, "must be at least 1"));
            }
        }
        for (key, ms) in [
            ("pipeline.drain_timeout_ms", p.drain_timeout_ms),
            ("pipeline.close_timeout_ms", p.close_timeout_ms),
            ("pipeline.end_of_input_grace_ms", p.end_of_input_grace_ms),
        ] {
            if ms == 0 {
                return Err(invalid(key, "must be greater than 0"));
            }
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(invalid("generation.temperature", "must be between 0.0 and 2.0"));
        }
        if self.generation.max_tokens == 0 {
            return Err(invalid("generation.max_tokens", "must be at least 1"));
        }
        if !in_unit_range(self.synthesis.stability) {
            return Err(invalid("synthesis.stability", "must be between 0.0 and 1.0"));
        }
        if !in_unit_range(self.synthesis.similarity_boost) {
            return Err(invalid(
                "synthesis.similarity_boost",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    /// Every collaborator must have an api key.
    pub fn validate_credentials(&self) -> Result<()> {
        for (collaborator, key) in [
            ("recognition", &self.recognition.api_key),
            ("generation", &self.generation.api_key),
            ("synthesis", &self.synthesis.api_key),
        ] {
            if key.as_deref().is_none_or(|k| k.trim().is_empty()) {
                return Err(VoicepipeError::FatalConfiguration {
                    collaborator: collaborator.to_string(),
                    message: "api key is missing".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Copy safe to print: api keys are masked.
    pub fn redacted(&self) -> Self {
        fn mask(key: &Option<String>) -> Option<String> {
            key.as_ref().map(|k| {
                let tail: String = k
                    .chars()
                    .rev()
                    .take(4)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                if k.chars().count() > 8 {
                    format!("****{tail}")
                } else {
                    "****".to_string()
                }
            })
        }
        let mut copy = self.clone();
        copy.recognition.api_key = mask(&self.recognition.api_key);
        copy.generation.api_key = mask(&self.generation.api_key);
        copy.synthesis.api_key = mask(&self.synthesis.api_key);
        copy
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VoicepipeError::Other(e.to_string()))
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voicepipe/config.toml on Linux
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            VoicepipeError::Other("could not determine config directory".to_string())
        })?;
        Ok(dir.join("voicepipe").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_voicepipe_env() {
        remove_env("VOICEPIPE_RECOGNITION_API_KEY");
        remove_env("VOICEPIPE_GENERATION_API_KEY");
        remove_env("VOICEPIPE_SYNTHESIS_API_KEY");
        remove_env("VOICEPIPE_LOG_LEVEL");
    }

    fn keyed() -> Config {
        let mut config = Config::default();
        config.recognition.api_key = Some("rk".into());
        config.generation.api_key = Some("gk".into());
        config.synthesis.api_key = Some("sk".into());
        config
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.pipeline.recognition_queue, 256);
        assert_eq!(config.pipeline.generation_queue, 32);
        assert_eq!(config.pipeline.drain_timeout_ms, 2000);
        assert!(config.pipeline.barge_in);

        assert_eq!(config.recognition.model, "nova-2");
        assert_eq!(config.recognition.language, "en-US");
        assert_eq!(config.generation.model, "llama3-70b-8192");
        assert_eq!(config.generation.max_tokens, 256);
        assert_eq!(config.synthesis.model_id, "eleven_turbo_v2_5");
        assert_eq!(
            config.generation.fallback_message,
            "I am having trouble connecting right now."
        );

        assert_eq!(config.logging.level, "info");
        assert!(config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [pipeline]
            recognition_queue = 64
            output_queue = 8
            barge_in = false

            [recognition]
            api_key = "dg-key"
            language = "de-DE"

            [generation]
            model = "mixtral-8x7b"
            temperature = 0.2

            [synthesis]
            voice_id = "custom"

            [logging]
            json = false
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.pipeline.recognition_queue, 64);
        assert_eq!(config.pipeline.output_queue, 8);
        assert!(!config.pipeline.barge_in);
        assert_eq!(config.recognition.api_key.as_deref(), Some("dg-key"));
        assert_eq!(config.recognition.language, "de-DE");
        assert_eq!(config.generation.model, "mixtral-8x7b");
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.synthesis.voice_id, "custom");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let config = Config::parse("[generation]\nmax_tokens = 64\n").unwrap();

        assert_eq!(config.generation.max_tokens, 64);
        assert_eq!(config.generation.model, "llama3-70b-8192");
        assert_eq!(config.pipeline, PipelineSection::default());
        assert_eq!(config.synthesis, SynthesisConfig::default());
    }

    #[test]
    fn test_env_override_api_keys() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voicepipe_env();

        set_env("VOICEPIPE_RECOGNITION_API_KEY", "r-env");
        set_env("VOICEPIPE_SYNTHESIS_API_KEY", "s-env");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.recognition.api_key.as_deref(), Some("r-env"));
        assert_eq!(config.generation.api_key, None);
        assert_eq!(config.synthesis.api_key.as_deref(), Some("s-env"));

        clear_voicepipe_env();
    }

    #[test]
    fn test_env_override_log_level() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voicepipe_env();

        set_env("VOICEPIPE_LOG_LEVEL", "debug");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.logging.level, "debug");

        clear_voicepipe_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voicepipe_env();

        set_env("VOICEPIPE_GENERATION_API_KEY", "");
        let config = Config::default().with_env_overrides();

        // Empty string should not override default
        assert_eq!(config.generation.api_key, None);

        clear_voicepipe_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [pipeline
            output_queue = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        let result = Config::load(temp_file.path());
        assert!(matches!(result, Err(VoicepipeError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.pipeline.synthesis_queue = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for pipeline.synthesis_queue: must be at least 1"
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.generation.temperature = 2.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.synthesis.stability = -0.1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.close_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_credentials() {
        assert!(keyed().validate_credentials().is_ok());

        let mut config = keyed();
        config.generation.api_key = Some("   ".into());
        let err = config.validate_credentials().unwrap_err();
        assert!(err.is_fatal_configuration());
        assert!(err.to_string().contains("generation"));

        assert!(Config::default().validate_credentials().is_err());
    }

    #[test]
    fn test_redacted_masks_api_keys() {
        let mut config = keyed();
        config.generation.api_key = Some("gsk_1234567890abcd".into());
        let shown = config.redacted();
        assert_eq!(shown.recognition.api_key.as_deref(), Some("****"));
        assert_eq!(shown.generation.api_key.as_deref(), Some("****abcd"));
        assert!(!shown.to_toml().unwrap().contains("gsk_"));
    }

    #[test]
    fn test_default_path_is_xdg_compliant() {
        let path = Config::default_path().unwrap();
        let path_str = path.to_string_lossy();

        assert!(path_str.contains("voicepipe"));
        assert!(path_str.ends_with("config.toml"));
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_voicepipe_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_errors_on_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[logging\njson = ").unwrap();

        assert!(Config::load_or_default(temp_file.path()).is_err());
    }
}
