use argh::FromArgs;
use infernum_vqa::{
    Analyzer, AnalyzerConfig, Engine,
    artifact::ArtifactStore,
    paligemma::{EOS_TOKEN, PaligemmaModel},
    server::{AppState, router},
};
use std::{path::PathBuf, sync::Arc};

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MODEL_DIR: &str = "./paligemma-3b-mix-224";
const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(FromArgs)]
/// Serves visual question answering over HTTP.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// directory holding the tokenizer and the weights
    #[argh(option, default = "PathBuf::from(DEFAULT_MODEL_DIR)")]
    model_dir: PathBuf,

    /// where saved images and predictions are written
    #[argh(option, default = "PathBuf::from(DEFAULT_OUTPUT_DIR)")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let model = PaligemmaModel::load(&args.model_dir)?;
    let engine = Arc::new(Engine::new(Analyzer::new(
        model,
        AnalyzerConfig::chat().with_end_of_turn_token(EOS_TOKEN),
    )));
    let store = Arc::new(ArtifactStore::new(&args.output_dir));

    let app = router(AppState { engine, store });

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
