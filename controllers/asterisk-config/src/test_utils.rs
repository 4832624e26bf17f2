//! Test utilities for unit testing the reconciliation cycle
//!
//! Helpers for building template trees, zip archives and engines backed by
//! the in-memory cluster.

#![allow(clippy::unwrap_used, reason = "test support code")]

use crate::config::{ArchiveSource, Config, ModuleList, SourceAuth};
use kubetemplate::mock::{MockClusterClient, StaticDiscoverer};
use kubetemplate::{Engine, EngineOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Writes `contents` to `path`, creating parent directories
pub fn write_file(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Writes a zip archive; entries with `None` contents are directories
pub fn write_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        match contents {
            Some(contents) => {
                zip.start_file(*name, options).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
            None => zip.add_directory(*name, options).unwrap(),
        }
    }
    zip.finish().unwrap();
}

/// Engine over the mock cluster with `namespace` as the default namespace
pub fn test_engine(cluster: &MockClusterClient, namespace: &str) -> Arc<Engine> {
    let options = EngineOptions {
        default_namespace: Some(namespace.to_string()),
        ..Default::default()
    };
    Arc::new(Engine::new(
        Arc::new(cluster.clone()),
        Arc::new(StaticDiscoverer::default()),
        options,
        &CancellationToken::new(),
        Handle::current(),
    ))
}

/// Configuration rooted in a temp directory: `defaults/`, `custom/`,
/// `export/` and a local `source.zip`
pub fn test_config(root: &Path) -> Config {
    for dir in ["defaults", "custom", "export"] {
        std::fs::create_dir_all(root.join(dir)).unwrap();
    }
    Config {
        cloud: String::new(),
        source: ArchiveSource::Local(root.join("source.zip")),
        namespace: Some("voice".to_string()),
        defaults_dir: root.join("defaults"),
        custom_dir: root.join("custom"),
        export_dir: root.join("export"),
        reload_modules: ModuleList::parse("res_pjsip.so"),
        ari_secret: None,
        ari_url: "http://127.0.0.1:8088/ari".to_string(),
        source_auth: SourceAuth::default(),
        min_reload_interval: Duration::from_secs(5),
        ari_ready_timeout: Duration::from_secs(600),
        kube_api_timeout: Duration::from_secs(10),
        min_runtime: Duration::from_secs(60),
        max_short_deaths: 10,
    }
}

/// Recursively lists `(relative path, contents)` of every file under `root`, sorted
pub fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(root)
        .into_iter()
        .map(Result::unwrap)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().display().to_string();
            (rel, std::fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}
