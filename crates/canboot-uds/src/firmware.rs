//! Firmware image loading

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::info;

use crate::error::BootloaderError;

/// Read a raw binary image on a blocking worker
///
/// The returned buffer is shared with the transfer session without copying.
pub async fn load(path: impl AsRef<Path>) -> Result<Bytes, BootloaderError> {
    let path = path.as_ref().to_path_buf();
    let worker_path = path.clone();

    let data = tokio::task::spawn_blocking(move || std::fs::read(&worker_path))
        .await
        .map_err(|e| firmware_error(&path, format!("loader task failed: {}", e)))?
        .map_err(|e| firmware_error(&path, e.to_string()))?;

    if data.is_empty() {
        return Err(BootloaderError::EmptyFirmware);
    }

    info!(path = %path.display(), bytes = data.len(), "Firmware loaded");
    Ok(Bytes::from(data))
}

fn firmware_error(path: &Path, message: String) -> BootloaderError {
    BootloaderError::Firmware {
        path: PathBuf::from(path),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_image() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        let image = load(file.path()).await.unwrap();
        assert_eq!(&image[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn test_empty_image_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load(file.path()).await,
            Err(BootloaderError::EmptyFirmware)
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        match load(&path).await {
            Err(BootloaderError::Firmware { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected firmware error, got {:?}", other),
        }
    }
}
