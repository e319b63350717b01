use argh::FromArgs;
use infernum_vqa::{
    Analyzer, AnalyzerConfig, GenerationConfig,
    batch::BatchRunner,
    generation::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_NUM_BEAMS},
    paligemma::{EOS_TOKEN, PaligemmaModel},
};
use std::path::PathBuf;

// defaults for the analyzer
const DEFAULT_MODEL_DIR: &str = "./paligemma-3b-mix-224";

// underscore spellings accepted next to the kebab-case flags
const FLAG_ALIASES: &[(&str, &str)] = &[
    ("--max_new_tokens", "--max-new-tokens"),
    ("--num_beams", "--num-beams"),
    ("--save_response", "--save-response"),
    ("--model_dir", "--model-dir"),
];

#[derive(FromArgs)]
/// Answers a question about an image or about every image of a directory.
struct AnalyzeArgs {
    /// an image file or a directory of images
    #[argh(positional)]
    path: PathBuf,

    /// the question to ask
    #[argh(positional)]
    query: String,

    /// maximum number of generated tokens
    #[argh(option, default = "DEFAULT_MAX_NEW_TOKENS")]
    max_new_tokens: usize,

    /// beam width, 1 for greedy search
    #[argh(option, default = "DEFAULT_NUM_BEAMS")]
    num_beams: usize,

    /// write each answer to a .txt file next to its image
    #[argh(switch)]
    save_response: bool,

    /// directory holding the tokenizer and the weights
    #[argh(option, default = "PathBuf::from(DEFAULT_MODEL_DIR)")]
    model_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = parse_args(std::env::args().collect());

    let config = GenerationConfig::new(args.max_new_tokens, args.num_beams);
    config.validate()?;

    let model = PaligemmaModel::load(&args.model_dir)?;
    let mut analyzer = Analyzer::new(
        model,
        AnalyzerConfig::batch().with_end_of_turn_token(EOS_TOKEN),
    );

    let mut stdout = std::io::stdout().lock();
    let report = BatchRunner::new(&mut analyzer, config, args.save_response).run(
        &args.path,
        &args.query,
        &mut stdout,
    )?;

    log::info!(
        "Analyzed {} image(s), {} failed",
        report.processed.len(),
        report.failed.len()
    );

    Ok(())
}

/// Rewrites the underscore flag aliases, leaving everything after `--` untouched.
fn normalize_flags(args: Vec<String>) -> Vec<String> {
    let mut positional_only = false;
    args.into_iter()
        .map(|arg| {
            if arg == "--" {
                positional_only = true;
            }
            if positional_only {
                return arg;
            }
            FLAG_ALIASES
                .iter()
                .find(|(alias, _)| *alias == arg)
                .map_or(arg, |(_, flag)| flag.to_string())
        })
        .collect()
}

// argh::from_env over the normalized arguments
fn parse_args(args: Vec<String>) -> AnalyzeArgs {
    let args = normalize_flags(args);
    let cmd = args.first().map_or("vqa-analyze", String::as_str);
    let rest = args.iter().skip(1).map(String::as_str).collect::<Vec<_>>();

    AnalyzeArgs::from_args(&[cmd], &rest).unwrap_or_else(|early_exit| {
        std::process::exit(match early_exit.status {
            Ok(()) => {
                println!("{}", early_exit.output);
                0
            }
            Err(()) => {
                eprintln!(
                    "{}\nRun {} --help for more information.",
                    early_exit.output, cmd
                );
                1
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn underscore_flags_are_accepted() {
        let parsed = parse_args(args(&[
            "vqa-analyze",
            "photos",
            "how many dogs?",
            "--max_new_tokens",
            "12",
            "--num_beams",
            "3",
            "--save_response",
        ]));

        assert_eq!(parsed.path, PathBuf::from("photos"));
        assert_eq!(parsed.query, "how many dogs?");
        assert_eq!((parsed.max_new_tokens, parsed.num_beams), (12, 3));
        assert!(parsed.save_response);
    }

    #[test]
    fn kebab_flags_and_defaults() {
        let parsed = parse_args(args(&["vqa-analyze", "a.png", "q", "--num-beams", "2"]));

        assert_eq!(parsed.num_beams, 2);
        assert_eq!(parsed.max_new_tokens, DEFAULT_MAX_NEW_TOKENS);
        assert!(!parsed.save_response);
        assert_eq!(parsed.model_dir, PathBuf::from(DEFAULT_MODEL_DIR));
    }

    #[test]
    fn arguments_after_separator_are_kept() {
        assert_eq!(
            normalize_flags(args(&["vqa-analyze", "--num_beams", "--", "--num_beams"])),
            args(&["vqa-analyze", "--num-beams", "--", "--num_beams"])
        );
    }
}
