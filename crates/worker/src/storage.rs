//! Persistence of generated images

use genloop_common::{GenLoopError, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persists one image and returns a reference the caller can hand out
pub trait ImageStore: Send + Sync {
    fn store(&self, image: &RgbImage, name: &str) -> Result<String>;
}

/// Writes PNG files under a directory
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageStore for FsImageStore {
    fn store(&self, image: &RgbImage, name: &str) -> Result<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(GenLoopError::storage(format!("invalid file name: {:?}", name)));
        }

        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(format!("{}.png", name));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| GenLoopError::storage(format!("failed to write {}: {}", path.display(), e)))?;

        debug!("Stored image at {}", path.display());
        Ok(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    #[test]
    fn test_store_writes_png() {
        let dir = TempDir::new().unwrap();
        let store = FsImageStore::new(dir.path().join("outputs"));
        let image = RgbImage::from_pixel(16, 8, Rgb([10, 20, 30]));

        let reference = store.store(&image, "batch_000").unwrap();

        assert!(reference.ends_with("batch_000.png"));
        let loaded = image::open(&reference).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (16, 8));
        assert_eq!(loaded.get_pixel(3, 3), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_store_rejects_path_names() {
        let dir = TempDir::new().unwrap();
        let store = FsImageStore::new(dir.path());
        let image = RgbImage::new(8, 8);

        assert!(matches!(
            store.store(&image, "../escape"),
            Err(GenLoopError::Storage(_))
        ));
        assert!(store.store(&image, "").is_err());
    }
}
