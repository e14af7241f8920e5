use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::artifact::{CaptureArtifact, PoemResult};
use crate::errors::StorageError;

/// Durable on-disk store for captured images and generated poems,
/// both keyed by cycle id. The image write is the durability point of
/// a cycle: it must land on disk before the capture stage is left.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    images_dir: PathBuf,
    poems_dir: PathBuf,
}

impl ArtifactStore {
    pub async fn new(images_dir: PathBuf, poems_dir: PathBuf) -> Result<Self, StorageError> {
        create_dir(&images_dir).await?;
        create_dir(&poems_dir).await?;
        Ok(Self {
            images_dir,
            poems_dir,
        })
    }

    pub fn image_path(&self, cycle_id: Uuid) -> PathBuf {
        self.images_dir.join(format!("{cycle_id}.jpg"))
    }

    pub fn poem_path(&self, cycle_id: Uuid) -> PathBuf {
        self.poems_dir.join(format!("{cycle_id}.txt"))
    }

    pub async fn save_image(&self, artifact: &CaptureArtifact) -> Result<PathBuf, StorageError> {
        let path = self.image_path(artifact.cycle_id());
        tokio::fs::write(&path, artifact.data())
            .await
            .map_err(|_| StorageError::WriteFailed {
                path: path.display().to_string(),
            })?;
        debug!(path = %path.display(), bytes = artifact.len(), "image artifact persisted");
        Ok(path)
    }

    pub async fn load_image(&self, cycle_id: Uuid) -> Result<Bytes, StorageError> {
        let path = self.image_path(cycle_id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::FileNotFound {
                path: path.display().to_string(),
            }),
            Err(e) => Err(StorageError::IoError(e)),
        }
    }

    pub async fn save_poem(&self, poem: &PoemResult) -> Result<PathBuf, StorageError> {
        let path = self.poem_path(poem.cycle_id());
        tokio::fs::write(&path, poem.text())
            .await
            .map_err(|_| StorageError::WriteFailed {
                path: path.display().to_string(),
            })?;
        debug!(path = %path.display(), "poem persisted");
        Ok(path)
    }
}

async fn create_dir(path: &Path) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|_| StorageError::CreateDirectoryFailed {
            path: path.display().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ArtifactStore {
        let base = std::env::temp_dir().join(format!("poetry-cam-test-{}", Uuid::new_v4()));
        ArtifactStore::new(base.join("images"), base.join("poems"))
            .await
            .expect("store init")
    }

    #[tokio::test]
    async fn test_image_round_trip() {
        let store = test_store().await;
        let id = Uuid::new_v4();
        let artifact = CaptureArtifact::new(id, Bytes::from_static(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]));

        let path = store.save_image(&artifact).await.unwrap();
        assert!(path.exists());

        let loaded = store.load_image(id).await.unwrap();
        assert_eq!(&loaded[..], artifact.data());
    }

    #[tokio::test]
    async fn test_load_missing_image() {
        let store = test_store().await;
        let result = store.load_image(Uuid::new_v4()).await;
        assert!(matches!(result, Err(StorageError::FileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_poem_persisted_as_plain_text() {
        let store = test_store().await;
        let id = Uuid::new_v4();
        let poem = PoemResult::new(id, "frost on the window\n".to_string()).unwrap();

        let path = store.save_poem(&poem).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "frost on the window");
    }
}
