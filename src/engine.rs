use std::num::NonZeroU32;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ModelConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The model could not be loaded. Fatal: the process must not serve.
    #[error("failed to load model: {0}")]
    Load(String),
    /// A generation call failed after the model was loaded.
    #[error("inference failed: {0}")]
    Inference(String),
    /// The inference worker thread is gone.
    #[error("inference worker is not running")]
    WorkerGone,
}

/// Per-call generation parameters.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Sampling temperature. `<= 0` samples greedily.
    pub temperature: f32,
    /// Generation halts when any of these appears in the output; the
    /// triggering string is excluded from the result.
    pub stop: Vec<String>,
}

/// Anything that can turn a prompt into a completion.
///
/// The HTTP layer depends on this seam instead of [`ModelSession`] directly
/// so it can be exercised with a deterministic stub.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<String, EngineError>;
}

// Command sent to the inference worker's loop
enum Command {
    Generate {
        prompt: String,
        params: GenerateParams,
        // Completed (or failed) generation goes back on this channel
        respond: oneshot::Sender<Result<String, EngineError>>,
    },
}

/// Owns the loaded model for the lifetime of the process.
///
/// The llama backend, model, and contexts live on a single dedicated OS
/// thread; callers talk to it over a command channel. That thread services
/// one command at a time, so concurrent `generate` calls are serialized
/// rather than racing on the shared engine (`LlamaContext` is `!Send`).
pub struct ModelSession {
    command_tx: mpsc::Sender<Command>,
    // Kept so the worker thread is joinable on shutdown paths; not accessed
    // in normal flow
    #[allow(dead_code)]
    worker: std::thread::JoinHandle<()>,
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("command_tx", &"<mpsc::Sender>")
            .field("worker", &"<JoinHandle>")
            .finish()
    }
}

impl ModelSession {
    /// Loads the model described by `config` and starts the worker loop.
    ///
    /// Blocks (asynchronously) until the model is fully loaded. A missing or
    /// corrupt model file resolves to [`EngineError::Load`]; callers are
    /// expected to treat that as fatal and not start serving.
    pub async fn initialize(config: &ModelConfig) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<Command>(32);
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("gguf-inference".to_string())
            .spawn(move || worker_loop(worker_config, command_rx, ready_tx))
            .map_err(|e| EngineError::Load(format!("failed to spawn inference thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { command_tx, worker }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Load(
                "inference worker exited during startup".to_string(),
            )),
        }
    }

    /// Produces continuation text for `prompt`.
    ///
    /// Queued behind any in-flight generation; returns once the worker has
    /// produced the (whitespace-trimmed) completion or failed.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<String, EngineError> {
        let (respond, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Generate {
                prompt: prompt.to_string(),
                params: params.clone(),
                respond,
            })
            .await
            .map_err(|_| EngineError::WorkerGone)?;

        response_rx.await.map_err(|_| EngineError::WorkerGone)?
    }
}

#[async_trait]
impl TextGenerator for ModelSession {
    async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<String, EngineError> {
        ModelSession::generate(self, prompt, params).await
    }
}

fn worker_loop(
    config: ModelConfig,
    mut commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), EngineError>>,
) {
    tracing::info!(path = %config.path.display(), "loading GGUF model");

    let (backend, model) = match load_model(&config) {
        Ok(loaded) => {
            tracing::info!(path = %config.path.display(), "model loaded");
            let _ = ready.send(Ok(()));
            loaded
        }
        Err(e) => {
            tracing::error!(error = %e, "model load failed");
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            Command::Generate {
                prompt,
                params,
                respond,
            } => {
                let result = run_generation(&backend, &model, &config, &prompt, &params);
                if let Err(e) = &result {
                    tracing::error!(error = %e, "generation failed");
                }
                // Receiver may have hung up (e.g. request timeout)
                let _ = respond.send(result);
            }
        }
    }
}

fn load_model(config: &ModelConfig) -> Result<(LlamaBackend, LlamaModel), EngineError> {
    let backend =
        LlamaBackend::init().map_err(|e| EngineError::Load(format!("backend init: {e}")))?;

    let model_params = LlamaModelParams::default()
        .with_n_gpu_layers(config.gpu_layers)
        .with_use_mmap(config.use_mmap)
        .with_use_mlock(config.use_mlock);

    let model = LlamaModel::load_from_file(&backend, &config.path, &model_params)
        .map_err(|e| EngineError::Load(e.to_string()))?;

    Ok((backend, model))
}

fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    config: &ModelConfig,
    prompt: &str,
    params: &GenerateParams,
) -> Result<String, EngineError> {
    // Fresh context per call: no KV state leaks between requests
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(config.context_size))
        .with_n_threads(config.threads as i32)
        .with_n_threads_batch(config.threads as i32);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::Inference(format!("context creation: {e}")))?;

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| EngineError::Inference(format!("tokenization: {e}")))?;

    let n_ctx = ctx.n_ctx() as usize;
    if tokens.is_empty() {
        return Err(EngineError::Inference("empty prompt".to_string()));
    }
    if tokens.len() >= n_ctx {
        return Err(EngineError::Inference(format!(
            "prompt occupies {} of {} context tokens",
            tokens.len(),
            n_ctx
        )));
    }

    let mut batch = LlamaBatch::new(n_ctx, 1);
    let last_index = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last_index)
            .map_err(|e| EngineError::Inference(format!("batch add: {e}")))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("prompt decode: {e}")))?;

    let mut sampler = build_sampler(params.temperature);
    let mut output = String::new();
    let mut n_cur = tokens.len();
    let mut generated = 0u32;

    while generated < params.max_tokens && n_cur < n_ctx {
        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            break;
        }
        generated += 1;

        let piece = model
            .token_to_str(token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("detokenization: {e}")))?;
        output.push_str(&piece);

        // Stop sequences can span token boundaries, so scan the whole
        // accumulated output rather than the last piece
        let kept = truncate_at_stop(&output, &params.stop).len();
        if kept != output.len() {
            output.truncate(kept);
            break;
        }

        batch.clear();
        batch
            .add(token, n_cur as i32, &[0], true)
            .map_err(|e| EngineError::Inference(format!("batch add: {e}")))?;
        n_cur += 1;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("decode: {e}")))?;
    }

    Ok(output.trim().to_string())
}

fn build_sampler(temperature: f32) -> LlamaSampler {
    if temperature <= 0.0 {
        return LlamaSampler::greedy();
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    LlamaSampler::chain_simple([LlamaSampler::temp(temperature), LlamaSampler::dist(seed)])
}

/// Cuts `text` at the earliest occurrence of any stop sequence, excluding
/// the stop string itself. Returns `text` unchanged when none matches.
pub fn truncate_at_stop<'a, S: AsRef<str>>(text: &'a str, stops: &[S]) -> &'a str {
    let earliest = stops
        .iter()
        .filter_map(|stop| {
            let stop = stop.as_ref();
            if stop.is_empty() {
                None
            } else {
                text.find(stop)
            }
        })
        .min();

    match earliest {
        Some(index) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOPS: [&str; 3] = ["User:", "System:", "\n\n"];

    #[test]
    fn truncates_before_stop_sequence() {
        let echoed = "The answer is 4.\n\nUser: what next";
        assert_eq!(truncate_at_stop(echoed, &STOPS), "The answer is 4.");
    }

    #[test]
    fn earliest_stop_wins() {
        let text = "first System: second\n\nUser: third";
        assert_eq!(truncate_at_stop(text, &STOPS), "first ");
    }

    #[test]
    fn stop_string_is_excluded() {
        assert_eq!(truncate_at_stop("before User: after", &STOPS), "before ");
        assert!(!truncate_at_stop("before User: after", &STOPS).contains("User:"));
    }

    #[test]
    fn text_without_stop_passes_through() {
        assert_eq!(truncate_at_stop("plain text", &STOPS), "plain text");
        assert_eq!(truncate_at_stop("", &STOPS), "");
    }

    #[test]
    fn empty_stop_sequences_never_match() {
        let stops: [&str; 1] = [""];
        assert_eq!(truncate_at_stop("anything", &stops), "anything");
    }
}
