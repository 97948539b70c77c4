use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL_PATH: &str = "models/gpt-oss-20b-MXFP4.gguf";
const DEFAULT_THREADS: u32 = 4;
const DEFAULT_CONTEXT_SIZE: u32 = 2048;
const DEFAULT_GPU_LAYERS: u32 = 0;
const DEFAULT_PORT: u16 = 8000;

/// Parameters for loading the GGUF model. Fixed after startup.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub path: PathBuf,
    /// CPU threads used for inference. Always >= 1.
    pub threads: u32,
    /// Context window in tokens. Always >= 1.
    pub context_size: u32,
    /// Number of layers offloaded to an accelerator (0 = CPU only).
    pub gpu_layers: u32,
    /// Memory-map the model file instead of reading it into RAM.
    pub use_mmap: bool,
    /// Lock model memory to prevent swapping.
    pub use_mlock: bool,
}

/// Full gateway configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub model: ModelConfig,
    /// Label reported in `/health` and completion envelopes.
    pub model_name: String,
    /// HTTP listen port (the `serve --port` flag overrides it).
    pub port: u16,
    /// Optional per-request generation deadline. `None` means no timeout.
    pub request_timeout: Option<Duration>,
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Unset variables take their documented default. Values that fail to
    /// parse also fall back to the default, with a warning.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GGUF_MODEL_PATH` | `models/gpt-oss-20b-MXFP4.gguf` |
    /// | `GGUF_MODEL_NAME` | file stem of the model path |
    /// | `GGUF_THREADS` | `4` |
    /// | `GGUF_CONTEXT_SIZE` | `2048` |
    /// | `GGUF_GPU_LAYERS` | `0` |
    /// | `GGUF_MMAP` | `true` |
    /// | `GGUF_MLOCK` | `false` |
    /// | `GGUF_PORT` | `8000` |
    /// | `GGUF_REQUEST_TIMEOUT_SECS` | unset (no timeout) |
    pub fn from_env() -> Self {
        let path = PathBuf::from(
            std::env::var("GGUF_MODEL_PATH").unwrap_or_else(|_| DEFAULT_MODEL_PATH.to_string()),
        );

        let model_name = std::env::var("GGUF_MODEL_NAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| model_name_from_path(&path));

        let model = ModelConfig {
            threads: env_or("GGUF_THREADS", DEFAULT_THREADS).max(1),
            context_size: env_or("GGUF_CONTEXT_SIZE", DEFAULT_CONTEXT_SIZE).max(1),
            gpu_layers: env_or("GGUF_GPU_LAYERS", DEFAULT_GPU_LAYERS),
            use_mmap: env_or("GGUF_MMAP", true),
            use_mlock: env_or("GGUF_MLOCK", false),
            path,
        };

        // 0 (the default) means no deadline, matching the source behavior.
        let timeout_secs: u64 = env_or("GGUF_REQUEST_TIMEOUT_SECS", 0);

        GatewayConfig {
            model,
            model_name,
            port: env_or("GGUF_PORT", DEFAULT_PORT),
            request_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    parse_or(key, std::env::var(key).ok(), default)
}

fn parse_or<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(%key, %value, "unparseable environment value, using default");
            default
        }),
        None => default,
    }
}

fn model_name_from_path(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("gguf-model")
        .to_string()
}
