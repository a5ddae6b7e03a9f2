use ductile_core::ApiError;

/// Error type for descriptor loading and validation.
#[derive(Debug)]
pub enum ConfigError {
    /// I/O or YAML parsing failure. Carries the offending file when known.
    Load { file: Option<String>, message: String },
    /// Structural violation in a parsed descriptor.
    Invalid { file: Option<String>, message: String },
    /// Include directive cycle or unresolvable target.
    Include { file: String, message: String },
}

impl ConfigError {
    pub fn load(file: impl Into<Option<String>>, message: impl Into<String>) -> Self {
        ConfigError::Load {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn invalid(file: impl Into<Option<String>>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            file: file.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (file, message) = match self {
            ConfigError::Load { file, message } => (file.as_deref(), message),
            ConfigError::Invalid { file, message } => (file.as_deref(), message),
            ConfigError::Include { file, message } => (Some(file.as_str()), message),
        };
        match file {
            Some(file) => write!(f, "{file}: {message}"),
            None => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::Configuration(err.to_string())
    }
}
