use kornia_image::{Image, allocator::CpuAllocator};

use crate::generation::GenerationConfig;
use crate::preprocess::AspectRatioPolicy;
use crate::stopping::StoppingCriteria;

/// Trait for the vision-language runtime the analyzer delegates to.
///
/// Implementors own the weights, the tokenizer and the image processor. Image tiling,
/// tokenization and decoding internals stay behind this trait so the orchestration code can
/// be driven by a fake in tests.
pub trait VisionLanguageModel {
    /// The merged image and text inputs of one generation call.
    type Inputs;
    /// The error type that can be returned by the runtime.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Preprocesses the image and tokenizes the prompt into one request bundle.
    fn prepare(
        &mut self,
        image: &Image<u8, 3, CpuAllocator>,
        prompt: &str,
        aspect_ratio: AspectRatioPolicy,
    ) -> Result<Self::Inputs, Self::Error>;

    /// Runs deterministic generation and returns the generated ids of each row, best first.
    fn generate(
        &mut self,
        inputs: Self::Inputs,
        config: &GenerationConfig,
        stop: &dyn StoppingCriteria,
    ) -> Result<Vec<Vec<u32>>, Self::Error>;

    /// Decodes token ids into text, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String, Self::Error>;

    /// Looks up the id of a token in the vocabulary.
    fn token_id(&self, token: &str) -> Option<u32>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! A byte-level model that answers with a scripted reply.

    use super::*;
    use crate::generation::{self, TokenScorer};
    use std::convert::Infallible;

    pub const END_OF_TURN: u32 = 256;
    const VOCAB: usize = 257;

    pub struct ScriptedModel {
        pub reply: String,
        pub prompts: Vec<String>,
        pub image_sizes: Vec<(usize, usize)>,
        panic_marker: Option<String>,
        prompt_len: usize,
    }

    impl ScriptedModel {
        pub fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: Vec::new(),
                image_sizes: Vec::new(),
                panic_marker: None,
                prompt_len: 0,
            }
        }

        /// Panics in `prepare` when the prompt contains `marker`.
        pub fn panic_on(mut self, marker: &str) -> Self {
            self.panic_marker = Some(marker.to_string());
            self
        }
    }

    impl TokenScorer for ScriptedModel {
        type Error = Infallible;

        fn score(&mut self, rows: &[Vec<u32>]) -> Result<Vec<Vec<f32>>, Self::Error> {
            let script = self.reply.as_bytes();
            Ok(rows
                .iter()
                .map(|row| {
                    let position = row.len() - self.prompt_len;
                    let next = script
                        .get(position)
                        .map_or(END_OF_TURN, |&byte| byte as u32);
                    let mut scores = vec![-20.0; VOCAB];
                    scores[next as usize] = 0.0;
                    scores
                })
                .collect())
        }
    }

    impl VisionLanguageModel for ScriptedModel {
        type Inputs = Vec<u32>;
        type Error = Infallible;

        fn prepare(
            &mut self,
            image: &Image<u8, 3, CpuAllocator>,
            prompt: &str,
            _aspect_ratio: AspectRatioPolicy,
        ) -> Result<Self::Inputs, Self::Error> {
            if let Some(marker) = &self.panic_marker {
                assert!(!prompt.contains(marker.as_str()), "prompt contains {marker}");
            }
            self.prompts.push(prompt.to_string());
            self.image_sizes.push((image.width(), image.height()));
            Ok(prompt.bytes().map(u32::from).collect())
        }

        fn generate(
            &mut self,
            inputs: Self::Inputs,
            config: &GenerationConfig,
            stop: &dyn StoppingCriteria,
        ) -> Result<Vec<Vec<u32>>, Self::Error> {
            self.prompt_len = inputs.len();
            generation::generate(self, &inputs, config, stop)
        }

        fn decode(&self, ids: &[u32]) -> Result<String, Self::Error> {
            let bytes = ids
                .iter()
                .filter(|&&id| id != END_OF_TURN)
                .map(|&id| id as u8)
                .collect::<Vec<_>>();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn token_id(&self, token: &str) -> Option<u32> {
            (token == "<|end|>").then_some(END_OF_TURN)
        }
    }
}
