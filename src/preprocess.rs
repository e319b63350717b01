use kornia_image::{Image, ImageError, ImageSize, allocator::CpuAllocator};
use kornia_imgproc::{interpolation::InterpolationMode, resize::resize_fast};

/// How an image is fitted to the resolution the vision encoder expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AspectRatioPolicy {
    /// Stretch the image to the target resolution.
    Resize,
    /// Pick the best fitting resolution among the supported grid and pad to it, keeping the
    /// native aspect ratio.
    #[default]
    AnyRes,
}

/// Selects the candidate resolution that keeps most of the original pixels.
///
/// Candidates are ranked by effective resolution (the downscaled area of the original
/// image, capped at its native area), then by the smallest padded area.
pub fn select_best_resolution(original: ImageSize, candidates: &[ImageSize]) -> Option<ImageSize> {
    let original_area = original.width * original.height;
    let mut best: Option<(ImageSize, usize, usize)> = None;

    for &candidate in candidates {
        let scale = f64::min(
            candidate.width as f64 / original.width as f64,
            candidate.height as f64 / original.height as f64,
        );
        let downscaled_width = (original.width as f64 * scale) as usize;
        let downscaled_height = (original.height as f64 * scale) as usize;
        let effective = (downscaled_width * downscaled_height).min(original_area);
        let wasted = candidate.width * candidate.height - effective;

        let better = match best {
            None => true,
            Some((_, best_effective, best_wasted)) => {
                effective > best_effective || (effective == best_effective && wasted < best_wasted)
            }
        };
        if better {
            best = Some((candidate, effective, wasted));
        }
    }

    best.map(|(size, _, _)| size)
}

/// Resizes keeping the aspect ratio and centers the result on a black canvas of `target`.
pub fn resize_and_pad(
    image: &Image<u8, 3, CpuAllocator>,
    target: ImageSize,
) -> Result<Image<u8, 3, CpuAllocator>, ImageError> {
    let scale_w = target.width as f64 / image.width() as f64;
    let scale_h = target.height as f64 / image.height() as f64;

    let scaled = if scale_w < scale_h {
        ImageSize {
            width: target.width,
            height: ((image.height() as f64 * scale_w).ceil() as usize).clamp(1, target.height),
        }
    } else {
        ImageSize {
            width: ((image.width() as f64 * scale_h).ceil() as usize).clamp(1, target.width),
            height: target.height,
        }
    };

    let mut resized = Image::from_size_val(scaled, 0, CpuAllocator)?;
    resize_fast(image, &mut resized, InterpolationMode::Bilinear)?;

    let mut canvas = Image::from_size_val(target, 0, CpuAllocator)?;
    let offset_x = (target.width - scaled.width) / 2;
    let offset_y = (target.height - scaled.height) / 2;

    let src = resized.as_slice();
    let dst = canvas.as_slice_mut();
    let src_stride = scaled.width * 3;
    let dst_stride = target.width * 3;
    for row in 0..scaled.height {
        let src_row = &src[row * src_stride..(row + 1) * src_stride];
        let dst_start = (row + offset_y) * dst_stride + offset_x * 3;
        dst[dst_start..dst_start + src_stride].copy_from_slice(src_row);
    }

    Ok(canvas)
}

/// Fits the image to one of `resolutions` according to `policy`.
pub fn fit_image(
    image: &Image<u8, 3, CpuAllocator>,
    policy: AspectRatioPolicy,
    resolutions: &[ImageSize],
) -> Result<Image<u8, 3, CpuAllocator>, ImageError> {
    let target = select_best_resolution(image.size(), resolutions).unwrap_or(image.size());
    match policy {
        AspectRatioPolicy::AnyRes => resize_and_pad(image, target),
        AspectRatioPolicy::Resize => {
            let mut resized = Image::from_size_val(target, 0, CpuAllocator)?;
            resize_fast(image, &mut resized, InterpolationMode::Bilinear)?;
            Ok(resized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(width: usize, height: usize) -> ImageSize {
        ImageSize { width, height }
    }

    #[test]
    fn best_resolution_prefers_effective_area() {
        let candidates = [size(384, 384), size(768, 384), size(384, 768)];
        assert_eq!(
            select_best_resolution(size(1000, 500), &candidates),
            Some(size(768, 384))
        );
        assert_eq!(
            select_best_resolution(size(300, 900), &candidates),
            Some(size(384, 768))
        );
    }

    #[test]
    fn best_resolution_breaks_ties_on_waste() {
        // a small image fits every candidate at full resolution
        let candidates = [size(768, 768), size(384, 384)];
        assert_eq!(
            select_best_resolution(size(100, 100), &candidates),
            Some(size(384, 384))
        );
        assert_eq!(select_best_resolution(size(100, 100), &[]), None);
    }

    #[test]
    fn resize_and_pad_centers_content() -> Result<(), Box<dyn std::error::Error>> {
        let image = Image::<u8, 3, CpuAllocator>::from_size_val(size(8, 4), 255, CpuAllocator)?;

        let padded = resize_and_pad(&image, size(4, 4))?;

        assert_eq!(padded.size(), size(4, 4));
        let data = padded.as_slice();
        let pixel = |x: usize, y: usize| data[(y * 4 + x) * 3];
        // 8x4 scaled into 4x2, one padded row above and below
        assert_eq!(pixel(0, 0), 0);
        assert_eq!(pixel(3, 3), 0);
        assert_eq!(pixel(0, 1), 255);
        assert_eq!(pixel(3, 2), 255);
        Ok(())
    }

    #[test]
    fn fit_image_resize_stretches() -> Result<(), Box<dyn std::error::Error>> {
        let image = Image::<u8, 3, CpuAllocator>::from_size_val(size(10, 2), 7, CpuAllocator)?;

        let fitted = fit_image(&image, AspectRatioPolicy::Resize, &[size(6, 6)])?;

        assert_eq!(fitted.size(), size(6, 6));
        assert!(fitted.as_slice().iter().all(|&v| v == 7));
        Ok(())
    }
}
