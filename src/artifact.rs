//! Date-partitioned storage of analyzed images and their predictions.
//!
//! Artifacts live under `<root>/<YYYY-MM-DD>/<NNNNNN>.{png,txt}` where the index is a
//! zero-padded counter scoped to the date directory. Index allocation is serialized per date
//! directory and each index is reserved by creating its image file exclusively, so concurrent
//! writers in this process or another never share an index.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{Local, NaiveDate};
use kornia_image::{Image, allocator::CpuAllocator};

const INDEX_DIGITS: usize = 6;
const MAX_INDEX: u32 = 999_999;
const MAX_RESERVE_ATTEMPTS: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    /// Another writer kept taking the candidate indices. Retrying the request is safe.
    #[error("could not reserve an artifact index in {}", .0.display())]
    Conflict(PathBuf),

    #[error("artifact index space exhausted in {}", .0.display())]
    IndexExhausted(PathBuf),

    #[error(transparent)]
    WriteImage(#[from] kornia_io::error::IoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A persisted image and prediction pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub index: u32,
    pub image_path: PathBuf,
    pub prediction_path: PathBuf,
}

/// Writes artifacts under a root directory.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The directory holding the artifacts of `date`.
    pub fn date_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    /// Persists under today's directory in local time.
    pub fn persist(
        &self,
        image: &Image<u8, 3, CpuAllocator>,
        prediction: &str,
    ) -> Result<Artifact, ArtifactError> {
        self.persist_on(Local::now().date_naive(), image, prediction)
    }

    /// Persists under the directory of `date` with the next free index.
    pub fn persist_on(
        &self,
        date: NaiveDate,
        image: &Image<u8, 3, CpuAllocator>,
        prediction: &str,
    ) -> Result<Artifact, ArtifactError> {
        let dir = self.date_dir(date);
        let lock = self.dir_lock(&dir);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        fs::create_dir_all(&dir)?;
        let (index, image_path) = reserve_index(&dir)?;
        let prediction_path = dir.join(format!("{index:06}.txt"));
        write_reserved(&image_path, &prediction_path, image, prediction)?;

        Ok(Artifact {
            index,
            image_path,
            prediction_path,
        })
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(dir.to_path_buf()).or_default().clone()
    }
}

/// Returns one past the largest artifact index found in `dir`, or `0` if there is none.
///
/// Only file stems made of exactly six digits are artifact indices; anything else is ignored.
pub fn next_index(dir: &Path) -> std::io::Result<u32> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut max_index = None;
    for entry in entries {
        let path = entry?.path();
        if let Some(index) = parse_index(&path) {
            max_index = max_index.max(Some(index));
        }
    }

    Ok(max_index.map_or(0, |index| index + 1))
}

fn parse_index(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != INDEX_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

// Creates the image file of the first free index exclusively.
fn reserve_index(dir: &Path) -> Result<(u32, PathBuf), ArtifactError> {
    let mut index = next_index(dir)?;
    for _ in 0..MAX_RESERVE_ATTEMPTS {
        if index > MAX_INDEX {
            return Err(ArtifactError::IndexExhausted(dir.to_path_buf()));
        }
        let image_path = dir.join(format!("{index:06}.png"));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&image_path)
        {
            Ok(_) => return Ok((index, image_path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                log::debug!("Artifact index {index} already taken, retrying");
                index += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ArtifactError::Conflict(dir.to_path_buf()))
}

// Fills a reserved slot. On failure both files are removed so no half pair is left behind.
fn write_reserved(
    image_path: &Path,
    prediction_path: &Path,
    image: &Image<u8, 3, CpuAllocator>,
    prediction: &str,
) -> Result<(), ArtifactError> {
    let written = (|| -> Result<(), ArtifactError> {
        kornia_io::png::write_image_png_rgb8(image_path, image)?;
        fs::write(prediction_path, prediction)?;
        Ok(())
    })();

    if let Err(e) = written {
        log::error!("Failed to save artifact {}: {e}", image_path.display());
        for path in [image_path, prediction_path].into_iter().filter(|p| p.is_file()) {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("Failed to remove {}: {e}", path.display());
            }
        }
        return Err(e);
    }

    log::info!("Saved image: {}", image_path.display());
    log::info!("Saved prediction: {}", prediction_path.display());
    Ok(())
}
