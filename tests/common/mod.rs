use std::convert::Infallible;

use infernum_vqa::{
    GenerationConfig, VisionLanguageModel, preprocess::AspectRatioPolicy,
    stopping::StoppingCriteria,
};
use kornia_image::{Image, allocator::CpuAllocator};

/// Answers every question with `reply`, cut to the token budget.
pub struct EchoModel(pub String);

impl VisionLanguageModel for EchoModel {
    type Inputs = ();
    type Error = Infallible;

    fn prepare(
        &mut self,
        _image: &Image<u8, 3, CpuAllocator>,
        _prompt: &str,
        _aspect_ratio: AspectRatioPolicy,
    ) -> Result<Self::Inputs, Self::Error> {
        Ok(())
    }

    fn generate(
        &mut self,
        _inputs: Self::Inputs,
        config: &GenerationConfig,
        _stop: &dyn StoppingCriteria,
    ) -> Result<Vec<Vec<u32>>, Self::Error> {
        let row = self.0.bytes().map(u32::from).take(config.max_new_tokens);
        Ok(vec![row.collect()])
    }

    fn decode(&self, ids: &[u32]) -> Result<String, Self::Error> {
        Ok(ids.iter().map(|&id| char::from(id as u8)).collect())
    }

    fn token_id(&self, _token: &str) -> Option<u32> {
        None
    }
}

/// A small PNG encoded in memory.
pub fn png_bytes() -> Vec<u8> {
    let pixels = image::RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(pixels)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}
