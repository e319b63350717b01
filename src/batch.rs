use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::analyzer::Analyzer;
use crate::error::VqaError;
use crate::generation::GenerationConfig;
use crate::image_io::is_supported_image;
use crate::model::VisionLanguageModel;

/// Outcome of a batch run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Lists the supported images of `dir` in file name order.
pub fn collect_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Path of the text file written next to an image.
pub fn response_path(image_path: &Path) -> PathBuf {
    image_path.with_extension("txt")
}

/// Runs one query over an image file or a directory of images.
pub struct BatchRunner<'a, M: VisionLanguageModel> {
    analyzer: &'a mut Analyzer<M>,
    config: GenerationConfig,
    save_response: bool,
}

impl<'a, M: VisionLanguageModel> BatchRunner<'a, M> {
    pub fn new(
        analyzer: &'a mut Analyzer<M>,
        config: GenerationConfig,
        save_response: bool,
    ) -> Self {
        Self {
            analyzer,
            config,
            save_response,
        }
    }

    /// Analyzes `path`, which may be a single image or a directory.
    ///
    /// In a directory a failing image is logged and skipped. A single image propagates its
    /// error.
    pub fn run<W: Write>(
        &mut self,
        path: &Path,
        query: &str,
        out: &mut W,
    ) -> Result<BatchReport, VqaError> {
        if path.is_dir() {
            return self.run_directory(path, query, out);
        }

        self.analyze_image(path, query, out)?;
        Ok(BatchReport {
            processed: vec![path.to_path_buf()],
            failed: Vec::new(),
        })
    }

    fn run_directory<W: Write>(
        &mut self,
        dir: &Path,
        query: &str,
        out: &mut W,
    ) -> Result<BatchReport, VqaError> {
        let images = collect_images(dir)?;
        log::info!("Found {} images in {}", images.len(), dir.display());

        let mut report = BatchReport::default();
        for image_path in images {
            match self.analyze_image(&image_path, query, out) {
                Ok(()) => report.processed.push(image_path),
                Err(e) => {
                    log::error!("Failed to analyze {}: {e}", image_path.display());
                    report.failed.push(image_path);
                }
            }
        }

        Ok(report)
    }

    fn analyze_image<W: Write>(
        &mut self,
        image_path: &Path,
        query: &str,
        out: &mut W,
    ) -> Result<(), VqaError> {
        let prediction = self.analyzer.answer_path(image_path, query, &self.config)?;
        let name = image_path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        writeln!(out, "==> {name}: {prediction}")?;

        if self.save_response {
            let response_path = response_path(image_path);
            fs::write(&response_path, &prediction)?;
            writeln!(out, "Response saved to: {}", response_path.display())?;
        }

        Ok(())
    }
}
