use std::path::Path;

use kornia_image::{Image, allocator::CpuAllocator};

use crate::error::VqaError;
use crate::generation::GenerationConfig;
use crate::image_io::read_image_rgb8;
use crate::model::VisionLanguageModel;
use crate::preprocess::AspectRatioPolicy;
use crate::prompt::PromptTemplate;
use crate::stopping::{DEFAULT_EOS_TOKEN_ID, EosStoppingCriteria};

/// Text marker ending an assistant turn.
pub const END_OF_TURN_MARKER: &str = "<|end|>";

/// Where a decoded answer is cut.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TruncationPolicy {
    /// Keep the text before the first occurrence of the marker.
    EndMarker(String),
    /// Keep the text before the first `.`.
    FirstSentence,
    /// Keep the decoded text as is.
    None,
}

impl TruncationPolicy {
    pub fn apply<'a>(&self, text: &'a str) -> &'a str {
        let marker = match self {
            TruncationPolicy::EndMarker(marker) if !marker.is_empty() => marker.as_str(),
            TruncationPolicy::FirstSentence => ".",
            _ => return text,
        };
        text.split(marker).next().unwrap_or(text)
    }
}

/// Prompting and post-processing settings of an [`Analyzer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub template: PromptTemplate,
    pub truncation: TruncationPolicy,
    /// Token looked up in the vocabulary to stop generation.
    pub end_of_turn_token: String,
    /// Stop id used when the vocabulary has no `end_of_turn_token`.
    pub eos_token_id: u32,
    pub aspect_ratio: AspectRatioPolicy,
}

impl AnalyzerConfig {
    /// Turn-delimited prompt, answers cut at the end-of-turn marker.
    pub fn chat() -> Self {
        Self {
            template: PromptTemplate::ChatTurns,
            truncation: TruncationPolicy::EndMarker(END_OF_TURN_MARKER.to_string()),
            end_of_turn_token: END_OF_TURN_MARKER.to_string(),
            eos_token_id: DEFAULT_EOS_TOKEN_ID,
            aspect_ratio: AspectRatioPolicy::AnyRes,
        }
    }

    /// Freeform prompt, answers cut at the first sentence.
    pub fn batch() -> Self {
        Self {
            template: PromptTemplate::Freeform,
            truncation: TruncationPolicy::FirstSentence,
            ..Self::chat()
        }
    }

    /// Stops generation on `token` instead of the end-of-turn marker.
    pub fn with_end_of_turn_token(mut self, token: impl Into<String>) -> Self {
        self.end_of_turn_token = token.into();
        self
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self::chat()
    }
}

/// Answers questions about images with a vision-language model.
pub struct Analyzer<M: VisionLanguageModel> {
    model: M,
    config: AnalyzerConfig,
    stop: EosStoppingCriteria,
}

impl<M: VisionLanguageModel> Analyzer<M> {
    pub fn new(model: M, config: AnalyzerConfig) -> Self {
        let eos_token_id = model
            .token_id(&config.end_of_turn_token)
            .unwrap_or_else(|| {
                log::warn!(
                    "Token {} not in vocabulary, stopping on id {}",
                    config.end_of_turn_token,
                    config.eos_token_id
                );
                config.eos_token_id
            });

        Self {
            model,
            config,
            stop: EosStoppingCriteria::new(eos_token_id),
        }
    }

    /// The token id that ends generation.
    pub fn eos_token_id(&self) -> u32 {
        self.stop.eos_token_id
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Answers `query` about `image`.
    ///
    /// Reaching `max_new_tokens` is not an error, the text generated so far is returned.
    pub fn answer(
        &mut self,
        image: &Image<u8, 3, CpuAllocator>,
        query: &str,
        config: &GenerationConfig,
    ) -> Result<String, VqaError> {
        config.validate()?;
        let config = GenerationConfig {
            eos_token_id: Some(self.stop.eos_token_id),
            ..config.clone()
        };

        let prompt = self.config.template.render(query);
        let inputs = self
            .model
            .prepare(image, &prompt, self.config.aspect_ratio)
            .map_err(VqaError::model)?;

        let rows = self
            .model
            .generate(inputs, &config, &self.stop)
            .map_err(VqaError::model)?;
        let best = rows.first().map(Vec::as_slice).unwrap_or_default();

        let text = self.model.decode(best).map_err(VqaError::model)?;
        Ok(self.config.truncation.apply(&text).to_string())
    }

    /// Reads the image at `path` and answers `query` about it.
    pub fn answer_path(
        &mut self,
        path: impl AsRef<Path>,
        query: &str,
        config: &GenerationConfig,
    ) -> Result<String, VqaError> {
        let image = read_image_rgb8(path)?;
        self.answer(&image, query, config)
    }
}
