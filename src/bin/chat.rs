use argh::FromArgs;
use infernum_vqa::{
    Analyzer, AnalyzerConfig, GenerationConfig,
    chat::ChatLoop,
    generation::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_NUM_BEAMS},
    paligemma::{EOS_TOKEN, PaligemmaModel},
};
use std::path::PathBuf;

const DEFAULT_MODEL_DIR: &str = "./paligemma-3b-mix-224";

#[derive(FromArgs)]
/// Interactive conversation about an image.
struct ChatArgs {
    /// directory holding the tokenizer and the weights
    #[argh(option, default = "PathBuf::from(DEFAULT_MODEL_DIR)")]
    model_dir: PathBuf,

    /// maximum number of generated tokens per answer
    #[argh(option, default = "DEFAULT_MAX_NEW_TOKENS")]
    max_new_tokens: usize,

    /// beam width, 1 for greedy search
    #[argh(option, default = "DEFAULT_NUM_BEAMS")]
    num_beams: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ChatArgs = argh::from_env();

    let config = GenerationConfig::new(args.max_new_tokens, args.num_beams);
    config.validate()?;

    let model = PaligemmaModel::load(&args.model_dir)?;
    let mut analyzer = Analyzer::new(
        model,
        AnalyzerConfig::chat().with_end_of_turn_token(EOS_TOKEN),
    );

    println!("Type 'clear' to pick another image, 'exit' to quit.");
    let stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    ChatLoop::new(&mut analyzer, config).run(stdin, &mut stdout)?;

    Ok(())
}
