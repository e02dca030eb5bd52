use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Handshake endpoint returning `{ "presigned_url": ... }` for the classifier model.
pub const DEFAULT_ENDPOINT: &str = "https://api.tensorcube.net/server/status/s3/classification";

/// Prefix of environment variables read by [`ClassifierConfig::from_env`].
pub const ENV_PREFIX: &str = "CLASSIFY_";

pub const CONFIG_ENDPOINT_KEY: &str = "ENDPOINT";
pub const CONFIG_LABELS_KEY: &str = "LABELS";
pub const CONFIG_CONNECT_TIMEOUT_KEY: &str = "CONNECT_TIMEOUT_SECS";
pub const CONFIG_REQUEST_TIMEOUT_KEY: &str = "REQUEST_TIMEOUT_SECS";
pub const CONFIG_STALL_TIMEOUT_KEY: &str = "STALL_TIMEOUT_SECS";
pub const CONFIG_INFERENCE_TIMEOUT_KEY: &str = "INFERENCE_TIMEOUT_SECS";
pub const CONFIG_PROGRESS_INTERVAL_KEY: &str = "PROGRESS_INTERVAL_MS";
pub const CONFIG_FRAME_INTERVAL_KEY: &str = "FRAME_INTERVAL_MS";
pub const CONFIG_MAX_UPLOAD_KEY: &str = "MAX_UPLOAD_BYTES";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Runtime configuration of the classifier pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Handshake endpoint minting the presigned model URL
    pub endpoint: String,

    /// Optional label file, one label per line
    pub labels_path: Option<PathBuf>,

    pub connect_timeout: Duration,

    /// Bound on the handshake request as a whole
    pub request_timeout: Duration,

    /// Longest wait for the next chunk of the model body
    pub stall_timeout: Duration,

    pub inference_timeout: Duration,

    /// Minimum wall-clock time between two progress reports
    pub progress_interval: Duration,

    /// Tick period of the progress animator
    pub frame_interval: Duration,

    pub max_upload_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            labels_path: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            max_upload_bytes: imagenetpreprocessor::MAX_IMAGE_BYTES,
        }
    }
}

impl ClassifierConfig {
    /// Build from `CLASSIFY_*` environment variables, prefix stripped.
    pub fn from_env() -> Self {
        let values: HashMap<String, String> = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect();

        ClassifierConfig::from(&values)
    }
}

impl From<&HashMap<String, String>> for ClassifierConfig {
    /// Unknown keys are ignored, malformed values keep their default.
    fn from(values: &HashMap<String, String>) -> ClassifierConfig {
        let defaults = ClassifierConfig::default();

        ClassifierConfig {
            endpoint: values
                .get(CONFIG_ENDPOINT_KEY)
                .cloned()
                .unwrap_or(defaults.endpoint),
            labels_path: values.get(CONFIG_LABELS_KEY).map(PathBuf::from),
            connect_timeout: parse_or(
                values,
                CONFIG_CONNECT_TIMEOUT_KEY,
                defaults.connect_timeout,
                Duration::from_secs,
            ),
            request_timeout: parse_or(
                values,
                CONFIG_REQUEST_TIMEOUT_KEY,
                defaults.request_timeout,
                Duration::from_secs,
            ),
            stall_timeout: parse_or(
                values,
                CONFIG_STALL_TIMEOUT_KEY,
                defaults.stall_timeout,
                Duration::from_secs,
            ),
            inference_timeout: parse_or(
                values,
                CONFIG_INFERENCE_TIMEOUT_KEY,
                defaults.inference_timeout,
                Duration::from_secs,
            ),
            progress_interval: parse_or(
                values,
                CONFIG_PROGRESS_INTERVAL_KEY,
                defaults.progress_interval,
                Duration::from_millis,
            ),
            frame_interval: parse_or(
                values,
                CONFIG_FRAME_INTERVAL_KEY,
                defaults.frame_interval,
                Duration::from_millis,
            ),
            max_upload_bytes: parse_or(
                values,
                CONFIG_MAX_UPLOAD_KEY,
                defaults.max_upload_bytes,
                |v: usize| v,
            ),
        }
    }
}

fn parse_or<N, T>(
    values: &HashMap<String, String>,
    key: &str,
    default: T,
    convert: impl Fn(N) -> T,
) -> T
where
    N: FromStr,
{
    match values.get(key) {
        Some(raw) => match raw.trim().parse::<N>() {
            Ok(n) => convert(n),
            Err(_) => {
                tracing::warn!(key, value = %raw, "invalid configuration value, keeping default");
                default
            }
        },
        None => default,
    }
}
