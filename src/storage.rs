use crate::models::AttachmentRef;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write attachment: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem-backed store for inbound attachment bodies. Rows reference
/// the stored path; the database never holds the bytes.
#[derive(Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn save(
        &self,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<AttachmentRef, StorageError> {
        let safe_name = sanitize_filename(filename);
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(&safe_name);
        tokio::fs::write(&path, bytes).await?;

        Ok(AttachmentRef {
            filename: safe_name,
            content_type: content_type.to_string(),
            size: bytes.len(),
            path: path.to_string_lossy().into_owned(),
        })
    }
}

/// Strips path separators and parent references out of client-supplied
/// filenames before they touch the filesystem.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim();

    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filenames_cannot_escape_the_store() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename(""), "attachment");
        assert_eq!(sanitize_filename("..."), "attachment");
    }

    #[tokio::test]
    async fn save_writes_bytes_and_metadata() {
        let dir = std::env::temp_dir().join(format!("mailroom-test-{}", Uuid::new_v4()));
        let store = AttachmentStore::new(dir.clone());

        let saved = store
            .save("invoice.pdf", "application/pdf", b"%PDF-fake")
            .await
            .unwrap();

        assert_eq!(saved.filename, "invoice.pdf");
        assert_eq!(saved.content_type, "application/pdf");
        assert_eq!(saved.size, 9);
        assert_eq!(tokio::fs::read(&saved.path).await.unwrap(), b"%PDF-fake");

        tokio::fs::remove_dir_all(dir).await.ok();
    }
}
