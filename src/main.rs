use clap::{Parser, Subcommand};
use gguf_gateway::{server, AppState, GatewayConfig, GenerateParams, ModelSession, Result};

#[derive(Parser)]
#[command(name = "gguf-gateway")]
#[command(about = "OpenAI-compatible HTTP gateway for local GGUF models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OpenAI-compatible API server
    Serve {
        /// Port to listen on (overrides GGUF_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a single prompt through the model and print the completion
    Run {
        prompt: String,
        #[arg(long, default_value_t = 256)]
        max_tokens: u32,
        #[arg(long, default_value_t = 0.3)]
        temperature: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = GatewayConfig::from_env();
    let session = ModelSession::initialize(&config.model).await?;

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.port);
            let state = AppState::new(session, &config);
            server::serve(state, port).await?;
        }
        Commands::Run {
            prompt,
            max_tokens,
            temperature,
        } => {
            // Same template the gateway uses, with an empty system prompt
            let full_prompt = server::build_prompt("", &prompt);
            let params = GenerateParams {
                max_tokens,
                temperature,
                stop: gguf_gateway::STOP_SEQUENCES
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            };
            let text = session.generate(&full_prompt, &params).await?;
            println!("{text}");
        }
    }

    Ok(())
}
