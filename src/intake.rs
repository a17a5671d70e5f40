use std::path::Path;

use camino::Utf8PathBuf;
use tempfile::{Builder, TempPath};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::domain::{OwnerId, PointCloudFormat};
use crate::error::VaultError;

/// Validates incoming uploads and stages them in the scratch area.
#[derive(Debug, Clone)]
pub struct Intake {
    scratch: Utf8PathBuf,
    max_bytes: u64,
}

/// A staged upload awaiting conversion. The staged file is removed when this
/// value is dropped, whatever the conversion outcome.
#[derive(Debug)]
pub struct StagedUpload {
    path: TempPath,
    pub owner_id: OwnerId,
    pub original_name: String,
    pub format: PointCloudFormat,
    pub byte_size: u64,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the staged file, reporting failures instead of swallowing them.
    pub fn discard(self) -> Result<(), VaultError> {
        self.path
            .close()
            .map_err(|err| VaultError::Filesystem(format!("remove staged upload: {err}")))
    }
}

impl Intake {
    pub fn new(scratch: Utf8PathBuf, max_bytes: u64) -> Self {
        Self { scratch, max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Streams `body` into a uniquely named scratch file.
    ///
    /// Name and extension are checked before any byte is written. The size
    /// ceiling is enforced while streaming; on any rejection the partial file
    /// is gone before this returns.
    pub async fn stage<R>(
        &self,
        owner_id: OwnerId,
        original_name: &str,
        body: R,
    ) -> Result<StagedUpload, VaultError>
    where
        R: AsyncRead + Unpin,
    {
        let original_name = original_name.trim();
        if original_name.is_empty() {
            return Err(VaultError::MissingField("original_name"));
        }
        let format = PointCloudFormat::from_file_name(original_name)?;

        let scratch = self.scratch.clone();
        let suffix = format!(".{}", format.extension());
        let temp = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(scratch.as_std_path())?;
            Builder::new()
                .prefix("upload-")
                .suffix(&suffix)
                .tempfile_in(scratch.as_std_path())
        })
        .await?
        .map_err(|err| VaultError::Filesystem(format!("create staging file: {err}")))?;

        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut limited = body.take(self.max_bytes.saturating_add(1));
        let copied = tokio::io::copy(&mut limited, &mut file)
            .await
            .map_err(|err| VaultError::Filesystem(format!("stage upload: {err}")))?;

        if copied > self.max_bytes {
            debug!(owner_id = %owner_id, limit = self.max_bytes, "rejecting oversize upload");
            return Err(VaultError::UploadTooLarge {
                limit: self.max_bytes,
            });
        }
        if copied == 0 {
            return Err(VaultError::EmptyUpload);
        }

        file.flush()
            .await
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        file.sync_all()
            .await
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        drop(file);

        info!(
            owner_id = %owner_id,
            original_name,
            bytes = copied,
            staged = %path.display(),
            "upload staged"
        );

        Ok(StagedUpload {
            path,
            owner_id,
            original_name: original_name.to_string(),
            format,
            byte_size: copied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intake(max_bytes: u64) -> (tempfile::TempDir, Intake) {
        let temp = tempfile::tempdir().unwrap();
        let scratch = Utf8PathBuf::from_path_buf(temp.path().join("uploads")).unwrap();
        (temp, Intake::new(scratch, max_bytes))
    }

    fn scratch_entries(temp: &tempfile::TempDir) -> usize {
        match std::fs::read_dir(temp.path().join("uploads")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn stages_under_generated_name() {
        let (temp, intake) = intake(1024);
        let owner: OwnerId = "U1".parse().unwrap();
        let staged = intake
            .stage(owner, "../../etc/scan.LAS", &b"points"[..])
            .await
            .unwrap();

        assert_eq!(staged.byte_size, 6);
        assert_eq!(staged.format, PointCloudFormat::Las);
        assert!(staged.path().starts_with(temp.path().join("uploads")));
        let file_name = staged.path().file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("upload-"));
        assert!(file_name.ends_with(".las"));

        let path = staged.path().to_path_buf();
        staged.discard().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversize_upload_leaves_nothing_behind() {
        let (temp, intake) = intake(4);
        let owner: OwnerId = "U1".parse().unwrap();
        let err = intake
            .stage(owner, "scan.laz", &b"too many bytes"[..])
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::UploadTooLarge { limit: 4 }));
        assert_eq!(scratch_entries(&temp), 0);
    }

    #[tokio::test]
    async fn unbounded_limit_stages_without_overflow() {
        let (_temp, intake) = intake(u64::MAX);
        let owner: OwnerId = "U1".parse().unwrap();
        let staged = intake
            .stage(owner, "scan.las", &b"points"[..])
            .await
            .unwrap();

        assert_eq!(staged.byte_size, 6);
        staged.discard().unwrap();
    }

    #[tokio::test]
    async fn bad_extension_rejected_before_staging() {
        let (temp, intake) = intake(1024);
        let owner: OwnerId = "U1".parse().unwrap();
        let err = intake
            .stage(owner, "scan.txt", &b"points"[..])
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::InvalidExtension(_)));
        assert!(!temp.path().join("uploads").exists());
    }
}
