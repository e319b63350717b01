//! PaliGemma backend running on candle.
//!
//! NOTE: to run the model with Cuda, build with `--features cuda`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::{D, DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::paligemma::{Config, Model};
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use tokenizers::Tokenizer;

use crate::generation::{self, GenerationConfig, TokenScorer};
use crate::model::VisionLanguageModel;
use crate::preprocess::{AspectRatioPolicy, fit_image};
use crate::prompt::IMAGE_PLACEHOLDER;
use crate::stopping::StoppingCriteria;

const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Token the PaliGemma tokenizer ends every answer with.
pub const EOS_TOKEN: &str = "<eos>";

/// Side of the square image the vision tower consumes.
pub const IMAGE_SIZE: usize = 224;

#[derive(thiserror::Error, Debug)]
pub enum PaligemmaError {
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    ImageError(#[from] kornia_image::ImageError),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid weights index: {0}")]
    WeightsIndex(#[from] serde_json::Error),

    #[error("missing model asset: {}", .0.display())]
    MissingAsset(PathBuf),

    #[error("generate called before prepare")]
    NotPrepared,
}

/// Merged inputs of one generation call.
pub struct PaligemmaInputs {
    pixel_values: Tensor,
    input_ids: Vec<u32>,
}

/// The PaliGemma model with its tokenizer, loaded from a local directory.
pub struct PaligemmaModel {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    pixel_values: Option<Tensor>,
    // sequence whose keys and values are in the model cache
    cached: Option<Vec<u32>>,
}

impl PaligemmaModel {
    /// Loads `tokenizer.json` and the safetensors weights found in `model_dir`.
    pub fn load(model_dir: impl AsRef<Path>) -> Result<Self, PaligemmaError> {
        let model_dir = model_dir.as_ref();

        #[cfg(feature = "cuda")]
        let (device, dtype) = match Device::cuda_if_available(0) {
            Ok(device) => (device, DType::BF16),
            Err(e) => {
                log::warn!("CUDA not available, defaulting to CPU: {e}");
                (Device::Cpu, DType::F32)
            }
        };

        #[cfg(not(feature = "cuda"))]
        let (device, dtype) = (Device::Cpu, DType::F32);

        let tokenizer_path = model_dir.join(TOKENIZER_FILE);
        if !tokenizer_path.is_file() {
            return Err(PaligemmaError::MissingAsset(tokenizer_path));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)?;

        let filenames = weight_files(model_dir)?;
        log::info!(
            "Loading {} weight file(s) from {}",
            filenames.len(),
            model_dir.display()
        );

        let config = Config::paligemma_3b_224();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, dtype, &device)? };
        let model = Model::new(&config, vb)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dtype,
            pixel_values: None,
            cached: None,
        })
    }

    fn image_tensor(&self, image: &Image<u8, 3, CpuAllocator>) -> Result<Tensor, PaligemmaError> {
        // [1, 3, H, W] scaled to [-1, 1]
        let tensor = Tensor::from_raw_buffer(
            image.as_slice(),
            DType::U8,
            &[image.rows(), image.cols(), 3],
            &self.device,
        )?
        .to_dtype(self.dtype)?
        .permute((2, 0, 1))?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
        Ok(tensor)
    }

    fn last_log_probs(&self, logits: Tensor) -> Result<Vec<f32>, PaligemmaError> {
        let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok(log_probs.to_vec1::<f32>()?)
    }

    fn score_row(&mut self, row: &[u32]) -> Result<Vec<f32>, PaligemmaError> {
        let extends_cache = self
            .cached
            .as_ref()
            .is_some_and(|cached| row.len() == cached.len() + 1 && row.starts_with(cached));

        let logits = if extends_cache {
            let input = Tensor::new(&row[row.len() - 1..], &self.device)?.unsqueeze(0)?;
            self.model.forward(&input)?
        } else {
            let pixel_values = self
                .pixel_values
                .as_ref()
                .ok_or(PaligemmaError::NotPrepared)?;
            self.model.clear_kv_cache();
            let input = Tensor::new(row, &self.device)?.unsqueeze(0)?;
            self.model.setup(pixel_values, &input)?
        };

        self.cached = Some(row.to_vec());
        self.last_log_probs(logits)
    }
}

impl TokenScorer for PaligemmaModel {
    type Error = PaligemmaError;

    fn score(&mut self, rows: &[Vec<u32>]) -> Result<Vec<Vec<f32>>, Self::Error> {
        rows.iter().map(|row| self.score_row(row)).collect()
    }
}

impl VisionLanguageModel for PaligemmaModel {
    type Inputs = PaligemmaInputs;
    type Error = PaligemmaError;

    fn prepare(
        &mut self,
        image: &Image<u8, 3, CpuAllocator>,
        prompt: &str,
        aspect_ratio: AspectRatioPolicy,
    ) -> Result<Self::Inputs, Self::Error> {
        let native = ImageSize {
            width: IMAGE_SIZE,
            height: IMAGE_SIZE,
        };
        let fitted = fit_image(image, aspect_ratio, &[native])?;
        let pixel_values = self.image_tensor(&fitted)?;

        // image embeddings are injected by the vision tower, not through the text
        let text = prompt.replace(IMAGE_PLACEHOLDER, "");
        let input_ids = self.tokenizer.encode(text, true)?.get_ids().to_vec();
        log::debug!("Prompt encoded into {} tokens", input_ids.len());

        Ok(PaligemmaInputs {
            pixel_values,
            input_ids,
        })
    }

    fn generate(
        &mut self,
        inputs: Self::Inputs,
        config: &GenerationConfig,
        stop: &dyn StoppingCriteria,
    ) -> Result<Vec<Vec<u32>>, Self::Error> {
        self.pixel_values = Some(inputs.pixel_values);
        self.cached = None;

        let result = generation::generate(self, &inputs.input_ids, config, stop);

        self.model.clear_kv_cache();
        self.pixel_values = None;
        self.cached = None;
        result
    }

    fn decode(&self, ids: &[u32]) -> Result<String, Self::Error> {
        Ok(self.tokenizer.decode(ids, true)?)
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }
}

/// Resolves the safetensors files of `model_dir`, sharded or not.
pub fn weight_files(model_dir: &Path) -> Result<Vec<PathBuf>, PaligemmaError> {
    let index_path = model_dir.join(WEIGHTS_INDEX_FILE);
    if index_path.is_file() {
        let index: serde_json::Value = serde_json::from_slice(&std::fs::read(&index_path)?)?;
        let shards = index
            .get("weight_map")
            .and_then(|map| map.as_object())
            .map(|map| {
                map.values()
                    .filter_map(|file| file.as_str())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();

        let mut files = Vec::with_capacity(shards.len());
        for shard in shards {
            let path = model_dir.join(shard);
            if !path.is_file() {
                return Err(PaligemmaError::MissingAsset(path));
            }
            files.push(path);
        }
        if files.is_empty() {
            return Err(PaligemmaError::MissingAsset(index_path));
        }
        return Ok(files);
    }

    let single = model_dir.join(WEIGHTS_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }
    Err(PaligemmaError::MissingAsset(single))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn single_weights_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(WEIGHTS_FILE), b"")?;

        assert_eq!(weight_files(dir.path())?, vec![dir.path().join(WEIGHTS_FILE)]);
        Ok(())
    }

    #[test]
    fn sharded_weights_are_deduplicated_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        for shard in ["model-00002.safetensors", "model-00001.safetensors"] {
            fs::write(dir.path().join(shard), b"")?;
        }
        fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {
                "a": "model-00002.safetensors",
                "b": "model-00001.safetensors",
                "c": "model-00002.safetensors"
            }}"#,
        )?;

        assert_eq!(
            weight_files(dir.path())?,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_shard_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"a": "gone.safetensors"}}"#,
        )?;

        match weight_files(dir.path()) {
            Err(PaligemmaError::MissingAsset(path)) => {
                assert_eq!(path, dir.path().join("gone.safetensors"))
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn load_reports_missing_tokenizer() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            PaligemmaModel::load(dir.path()),
            Err(PaligemmaError::MissingAsset(path)) if path.ends_with(TOKENIZER_FILE)
        ));
    }
}
