//! ARI secret bootstrap
//!
//! The ARI password is shared with Asterisk through the export root: a
//! preset `ARI_AUTOSECRET` wins, otherwise a previously generated secret is
//! reused, otherwise a new one is generated and persisted.

use crate::error::ControllerError;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// File in the export root holding the generated ARI secret
pub const GENERATED_SECRET_FILE: &str = ".k8s-generated-secret";

/// Name templates read the ARI secret under via `env(...)`
pub const ARI_SECRET_ENV: &str = "ARI_AUTOSECRET";

/// Returns the ARI secret, creating and persisting one if needed.
///
/// # Errors
/// [`ControllerError::File`] if the persisted secret cannot be read or written.
pub async fn get_or_create(configured: Option<&str>, export_dir: &Path) -> Result<String, ControllerError> {
    if let Some(secret) = configured.filter(|s| !s.is_empty()) {
        return Ok(secret.to_string());
    }

    let path = export_dir.join(GENERATED_SECRET_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(existing) if !existing.trim().is_empty() => {
            info!("Using persisted ARI secret from {}", path.display());
            return Ok(existing.trim().to_string());
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ControllerError::file("Failed to read", &path)(e)),
    }

    let secret = uuid::Uuid::new_v4().simple().to_string();
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .await
        .map_err(ControllerError::file("Failed to create", &path))?;
    file.write_all(secret.as_bytes())
        .await
        .map_err(ControllerError::file("Failed to write", &path))?;
    file.flush()
        .await
        .map_err(ControllerError::file("Failed to write", &path))?;

    info!("Generated new ARI secret in {}", path.display());
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_configured_secret_wins() {
        let dir = tempfile::tempdir().unwrap();
        let secret = get_or_create(Some("preset"), dir.path()).await.unwrap();
        assert_eq!(secret, "preset");
        assert!(!dir.path().join(GENERATED_SECRET_FILE).exists());
    }

    #[tokio::test]
    async fn test_generated_secret_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();

        let first = get_or_create(None, dir.path()).await.unwrap();
        let path = dir.path().join(GENERATED_SECRET_FILE);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let second = get_or_create(Some(""), dir.path()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }
}
