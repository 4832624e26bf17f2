//! # Source Acquisition
//!
//! Getting the custom archive onto disk and unpacking it: materializing it
//! from a Secret, downloading it over HTTP, and extracting the zip into the
//! custom root.

use crate::config::{SourceAuth, is_remote};
use crate::error::ControllerError;
use futures::StreamExt;
use kubetemplate::{ClusterClient, ResourceKind};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Secret data key holding the archive
pub const SOURCE_SECRET_KEY: &str = "asterisk-config.zip";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// An archive ready to be extracted.
#[derive(Debug)]
pub enum ArchiveLocation {
    /// A file we do not own
    Local(PathBuf),
    /// A downloaded temp file, removed when dropped
    Downloaded(TempPath),
}

impl ArchiveLocation {
    /// Path of the archive.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Local(path) => path,
            Self::Downloaded(temp) => temp,
        }
    }
}

/// Reads the archive out of the source Secret and writes it to `dest`.
///
/// # Errors
/// Cluster errors, [`ControllerError::SourceSecret`] if the archive key is
/// missing, or a write failure.
pub async fn materialize_secret(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    dest: &Path,
) -> Result<(), ControllerError> {
    debug!("Fetching source secret {}/{}", namespace, name);
    let secret = cluster
        .get(ResourceKind::Secret, namespace, name)
        .await?
        .into_secret()?;

    let data = secret
        .data
        .and_then(|mut data| data.remove(SOURCE_SECRET_KEY))
        .ok_or_else(|| {
            ControllerError::SourceSecret(format!(
                "secret {namespace}/{name} has no {SOURCE_SECRET_KEY} key"
            ))
        })?;

    tokio::fs::write(dest, &data.0)
        .await
        .map_err(ControllerError::file("Failed to write", dest))?;
    info!(
        "Wrote {} bytes from secret {}/{} to {}",
        data.0.len(),
        namespace,
        name,
        dest.display()
    );
    Ok(())
}

/// Resolves `source` to a local archive, downloading it if it is a URL.
///
/// # Errors
/// See [`download`].
pub async fn fetch_archive(source: &str, auth: &SourceAuth) -> Result<ArchiveLocation, ControllerError> {
    if is_remote(source) {
        download(source, auth).await.map(ArchiveLocation::Downloaded)
    } else {
        Ok(ArchiveLocation::Local(PathBuf::from(source)))
    }
}

/// Download an archive to a temporary file
///
/// The body is streamed to disk. Non-2xx responses and empty bodies are errors.
///
/// # Errors
/// [`ControllerError::Http`] on transport failure, [`ControllerError::Download`]
/// on a bad response, or a temp file error.
pub async fn download(url: &str, auth: &SourceAuth) -> Result<TempPath, ControllerError> {
    info!("Downloading source from {}", url);

    let client = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
    let mut request = client.get(url);
    if let Some(username) = &auth.username {
        request = request.basic_auth(username, auth.password.as_ref());
    }
    if let Some(authorization) = &auth.authorization {
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ControllerError::Download(format!("request failed: {status}")));
    }
    if response.content_length() == Some(0) {
        return Err(ControllerError::Download("empty response".to_string()));
    }

    let temp = tempfile::Builder::new()
        .prefix("config-download")
        .tempfile()?
        .into_temp_path();
    let mut file = tokio::fs::File::create(&temp)
        .await
        .map_err(ControllerError::file("Failed to create", temp.to_path_buf()))?;

    let mut size: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(ControllerError::file("Failed to write", temp.to_path_buf()))?;
    }
    file.flush()
        .await
        .map_err(ControllerError::file("Failed to write", temp.to_path_buf()))?;

    // temp is removed on drop
    if size == 0 {
        return Err(ControllerError::Download("empty response".to_string()));
    }

    debug!("Downloaded {} bytes to {}", size, temp.display());
    Ok(temp)
}

/// Extracts a zip archive into `dest`, returning the number of files written.
///
/// Directory entries create directories and files overwrite. Entries that
/// would land outside `dest` are rejected.
///
/// # Errors
/// Archive, filesystem, or [`ControllerError::UnsafeArchivePath`] errors.
pub async fn extract(archive: &Path, dest: &Path) -> Result<usize, ControllerError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest)).await?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<usize, ControllerError> {
    info!("Extracting {} into {}", archive.display(), dest.display());
    let file = File::open(archive).map_err(ControllerError::file("Failed to open", archive))?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ControllerError::UnsafeArchivePath(entry.name().to_string()))?;
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(ControllerError::file("Failed to create", &out))?;
            continue;
        }

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(ControllerError::file("Failed to create", parent))?;
        }
        let mut writer = File::create(&out).map_err(ControllerError::file("Failed to create", &out))?;
        std::io::copy(&mut entry, &mut writer).map_err(ControllerError::file("Failed to write", &out))?;
        debug!("Extracted {}", out.display());
        files += 1;
    }

    info!("Extracted {} files from {}", files, archive.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_zip;
    use kubetemplate::mock::MockClusterClient;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_extract_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("src.zip");
        write_zip(
            &archive,
            &[("sip/", None), ("sip/pjsip.conf.tmpl", Some("[global]\n")), ("extensions.conf", Some("[default]\n"))],
        );
        let dest = dir.path().join("custom");

        let files = extract(&archive, &dest).await.unwrap();

        assert_eq!(files, 2);
        assert_eq!(
            std::fs::read_to_string(dest.join("sip/pjsip.conf.tmpl")).unwrap(),
            "[global]\n"
        );
        assert!(dest.join("extensions.conf").is_file());
    }

    #[tokio::test]
    async fn test_extract_rejects_escaping_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../outside.conf", Some("x"))]);

        let err = extract(&archive, &dir.path().join("custom")).await.unwrap_err();
        assert!(matches!(err, ControllerError::UnsafeArchivePath(_)));
        assert!(!dir.path().join("outside.conf").exists());
    }

    #[tokio::test]
    async fn test_materialize_secret() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MockClusterClient::new();
        cluster.add_secret("voice", "pbx-config", SOURCE_SECRET_KEY, b"PK-bytes");
        let dest = dir.path().join("asterisk-config.zip");

        materialize_secret(&cluster, "voice", "pbx-config", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"PK-bytes");
    }

    #[tokio::test]
    async fn test_materialize_secret_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MockClusterClient::new();
        cluster.add_secret("voice", "pbx-config", "other.zip", b"PK");

        let err = materialize_secret(&cluster, "voice", "pbx-config", &dir.path().join("a.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::SourceSecret(_)));
    }

    #[tokio::test]
    async fn test_download_with_authorization_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pbx.zip"))
            .and(header("authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04data".to_vec()))
            .mount(&server)
            .await;

        let auth = SourceAuth {
            authorization: Some("Bearer abc".to_string()),
            ..Default::default()
        };
        let temp = download(&format!("{}/pbx.zip", server.uri()), &auth).await.unwrap();
        let path = temp.to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"PK\x03\x04data");

        drop(temp);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_download_with_basic_auth() {
        let server = MockServer::start().await;
        // "user:pass"
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK".to_vec()))
            .mount(&server)
            .await;

        let auth = SourceAuth {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            authorization: None,
        };
        assert!(download(&server.uri(), &auth).await.is_ok());
    }

    #[tokio::test]
    async fn test_download_rejects_error_status_and_empty_body() {
        let server = MockServer::start().await;
        Mock::given(path("/missing.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/empty.zip"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let auth = SourceAuth::default();

        let err = download(&format!("{}/missing.zip", server.uri()), &auth).await.unwrap_err();
        assert!(matches!(err, ControllerError::Download(ref m) if m.contains("404")));

        let err = download(&format!("{}/empty.zip", server.uri()), &auth).await.unwrap_err();
        assert!(matches!(err, ControllerError::Download(ref m) if m == "empty response"));
    }

    #[tokio::test]
    async fn test_fetch_archive_local_is_untouched() {
        let location = fetch_archive("/source/asterisk-config.zip", &SourceAuth::default())
            .await
            .unwrap();
        assert_eq!(location.path(), Path::new("/source/asterisk-config.zip"));
    }
}
