use argh::FromArgs;
use infernum_vqa::{
    generation::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_NUM_BEAMS},
    server::AnalyzeReply,
};
use reqwest::multipart::{Form, Part};
use std::path::PathBuf;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8000;

#[derive(FromArgs)]
/// Client for the visual question answering service
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "analyze" or "status"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Analyze(AnalyzeCommand),
    Status(StatusCommand),
}

#[derive(FromArgs)]
/// Ask a question about an image
#[argh(subcommand, name = "analyze")]
struct AnalyzeCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the question to ask
    #[argh(option, short = 'q')]
    query: String,

    /// maximum number of generated tokens
    #[argh(option, default = "DEFAULT_MAX_NEW_TOKENS")]
    max_new_tokens: usize,

    /// beam width, 1 for greedy search
    #[argh(option, default = "DEFAULT_NUM_BEAMS")]
    num_beams: usize,

    /// ask the server to keep the image and the prediction
    #[argh(switch)]
    save_response: bool,
}

#[derive(FromArgs)]
/// Check the engine state
#[argh(subcommand, name = "status")]
struct StatusCommand {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        ClientCommands::Analyze(command) => {
            let bytes = tokio::fs::read(&command.image_path).await?;
            let file_name = command
                .image_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());

            let form = Form::new()
                .part("file", Part::bytes(bytes).file_name(file_name))
                .text("query", command.query)
                .text("max_new_tokens", command.max_new_tokens.to_string())
                .text("num_beams", command.num_beams.to_string())
                .text("save_response", command.save_response.to_string());

            let response = client
                .post(format!("http://{}/analyze", addr))
                .multipart(form)
                .send()
                .await?;

            if response.status().is_success() {
                let reply = response.json::<AnalyzeReply>().await?;
                println!("Prediction: {}", reply.prediction);
            } else {
                let status = response.status();
                let body = response.json::<serde_json::Value>().await?;
                log::error!("Request failed with {status}");
                println!("Error: {}", serde_json::to_string_pretty(&body)?);
            }
        }
        ClientCommands::Status(_) => {
            let response = client
                .get(format!("http://{}/status", addr))
                .send()
                .await?;

            let result = response.json::<serde_json::Value>().await?;
            println!("Result: {}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
