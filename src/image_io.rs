use std::path::Path;

use kornia_image::{Image, ImageSize, allocator::CpuAllocator};

use crate::error::VqaError;

/// Extensions accepted when scanning directories, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Returns true if the path has one of the [`SUPPORTED_EXTENSIONS`].
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// Reads an image file and converts it to rgb8, whatever its stored color type.
pub fn read_image_rgb8(path: impl AsRef<Path>) -> Result<Image<u8, 3, CpuAllocator>, VqaError> {
    let decoded = image::ImageReader::open(path.as_ref())?
        .with_guessed_format()?
        .decode()?;
    into_rgb8(decoded)
}

/// Decodes an in-memory encoded image and converts it to rgb8.
pub fn decode_image_rgb8(bytes: &[u8]) -> Result<Image<u8, 3, CpuAllocator>, VqaError> {
    into_rgb8(image::load_from_memory(bytes)?)
}

fn into_rgb8(decoded: image::DynamicImage) -> Result<Image<u8, 3, CpuAllocator>, VqaError> {
    let rgb = decoded.into_rgb8();
    let size = ImageSize {
        width: rgb.width() as usize,
        height: rgb.height() as usize,
    };
    Ok(Image::new(size, rgb.into_raw(), CpuAllocator)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn encode(img: image::DynamicImage, format: image::ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format)
            .expect("encode test image");
        bytes
    }

    #[test]
    fn allow_list_is_case_insensitive() {
        assert!(is_supported_image(&PathBuf::from("a.png")));
        assert!(is_supported_image(&PathBuf::from("dir/c.JPG")));
        assert!(is_supported_image(&PathBuf::from("d.JpEg")));
        assert!(!is_supported_image(&PathBuf::from("b.txt")));
        assert!(!is_supported_image(&PathBuf::from("png")));
        assert!(!is_supported_image(&PathBuf::from("e.webp")));
    }

    #[test]
    fn decode_normalizes_rgba_to_rgb() -> Result<(), Box<dyn std::error::Error>> {
        let rgba = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 128]));
        let bytes = encode(image::DynamicImage::ImageRgba8(rgba), image::ImageFormat::Png);

        let decoded = decode_image_rgb8(&bytes)?;

        assert_eq!(decoded.width(), 3);
        assert_eq!(decoded.height(), 2);
        assert_eq!(&decoded.as_slice()[..3], &[10, 20, 30]);
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        let result = decode_image_rgb8(b"definitely not an image");
        assert!(matches!(result, Err(VqaError::InputDecode(_))));
    }

    #[test]
    fn read_from_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gray.jpg");
        let gray = image::GrayImage::from_pixel(4, 4, image::Luma([200]));
        std::fs::write(
            &path,
            encode(image::DynamicImage::ImageLuma8(gray), image::ImageFormat::Jpeg),
        )?;

        let decoded = read_image_rgb8(&path)?;

        assert_eq!(decoded.size(), ImageSize { width: 4, height: 4 });
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(read_image_rgb8("/nonexistent/image.png").is_err());
    }
}
