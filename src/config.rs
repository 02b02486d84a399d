use std::{env, path::PathBuf, str::FromStr};

use thiserror::Error;

const DEFAULT_MODEL_PATH: &str = "./model/silkworm_model.pb";
const DEFAULT_CLASS_INDICES_PATH: &str = "./model/class_indices.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// What the predict handler does when one file in a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Discard every result and report the first error.
    #[default]
    Abort,
    /// Report the error in the failing file's slot and keep going.
    Isolate,
}

impl FromStr for ErrorPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(ErrorPolicy::Abort),
            "isolate" => Ok(ErrorPolicy::Isolate),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model_path: PathBuf,
    pub class_indices_path: PathBuf,
    pub input_op: String,
    pub output_op: String,
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub error_policy: ErrorPolicy,
    pub model_url: Option<String>,
    pub class_indices_url: Option<String>,
    pub artifact_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let body_limit_bytes = {
            const EXPECTED: &str = "a whole number of megabytes";
            let mb: usize = parse_or(&get, "BODY_LIMIT_MB", 20, EXPECTED)?;
            mb.checked_mul(1024 * 1024)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "BODY_LIMIT_MB",
                    expected: EXPECTED,
                    value: mb.to_string(),
                })?
        };
        let port: u16 = parse_or(&get, "PORT", 5020, "a valid number between 0 and 65535")?;

        let error_policy = match get("PREDICT_ERROR_POLICY") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "PREDICT_ERROR_POLICY",
                expected: "\"abort\" or \"isolate\"",
                value,
            })?,
            None => ErrorPolicy::default(),
        };

        Ok(Config {
            model_path: get("MODEL_PATH")
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.into())
                .into(),
            class_indices_path: get("CLASS_INDICES_PATH")
                .unwrap_or_else(|| DEFAULT_CLASS_INDICES_PATH.into())
                .into(),
            input_op: get("MODEL_INPUT_OP").unwrap_or_else(|| "x".into()),
            output_op: get("MODEL_OUTPUT_OP").unwrap_or_else(|| "Identity".into()),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            body_limit_bytes,
            error_policy,
            model_url: get("MODEL_URL"),
            class_indices_url: get("CLASS_INDICES_URL"),
            artifact_token: get("ARTIFACT_TOKEN"),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value,
        }),
        None => Ok(default),
    }
}
