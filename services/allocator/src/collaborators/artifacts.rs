//! Filesystem artifact store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rackalloc_id::HostId;
use tracing::info;

use super::ArtifactStore;
use crate::status::PostMortem;

/// Reads serial logs from `<serial_logs_dir>/<host id>.log` and writes
/// post-mortem packs as JSON under `post_mortem_dir`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    serial_logs_dir: PathBuf,
    post_mortem_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(serial_logs_dir: impl Into<PathBuf>, post_mortem_dir: impl Into<PathBuf>) -> Self {
        Self {
            serial_logs_dir: serial_logs_dir.into(),
            post_mortem_dir: post_mortem_dir.into(),
        }
    }

    fn serial_log_path(&self, host: &HostId) -> PathBuf {
        self.serial_logs_dir.join(format!("{host}.log"))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn serial_log_location(&self, host: &HostId) -> String {
        self.serial_log_path(host).display().to_string()
    }

    async fn serial_log(&self, host: &HostId) -> Result<Option<String>> {
        let path = self.serial_log_path(host);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn store_post_mortem(&self, pack: &PostMortem) -> Result<String> {
        tokio::fs::create_dir_all(&self.post_mortem_dir)
            .await
            .with_context(|| format!("creating {}", self.post_mortem_dir.display()))?;

        let name = format!(
            "allocation-{}-{}.json",
            pack.index,
            pack.captured_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        let path = self.post_mortem_dir.join(name);
        let body = serde_json::to_vec_pretty(pack)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        info!(allocation = %pack.index, path = %path.display(), "post-mortem pack stored");
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rackalloc_id::Ulid;
    use serde_json::json;

    use super::*;
    use crate::engine::{Engine, EngineConfig};
    use crate::hosts::host::tests::test_host;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("rackalloc-artifacts-{}", Ulid::new()))
    }

    #[tokio::test]
    async fn test_serial_log_roundtrip() {
        let dir = scratch_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = FsArtifactStore::new(&dir, dir.join("post-mortems"));
        let host = HostId::parse("server3").unwrap();

        assert_eq!(store.serial_log(&host).await.unwrap(), None);
        tokio::fs::write(dir.join("server3.log"), "BIOS ok\n")
            .await
            .unwrap();
        assert_eq!(
            store.serial_log(&host).await.unwrap().as_deref(),
            Some("BIOS ok\n")
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_post_mortem_writes_json() {
        let dir = scratch_dir();
        let store = FsArtifactStore::new(dir.join("serial"), dir.join("post-mortems"));

        let now = Instant::now();
        let mut engine = Engine::new(EngineConfig::default());
        let host = engine.add_host(test_host(0), now).unwrap();
        engine.checked_in(host, now).unwrap();
        let index = engine
            .allocate(&json!({"count": 1}), json!({"job": 1}), now)
            .unwrap();
        let pack =
            PostMortem::capture(&engine, index, |id| store.serial_log_location(id)).unwrap();

        let location = store.store_post_mortem(&pack).await.unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&location).await.unwrap()).unwrap();
        assert_eq!(written["allocationInfo"]["job"], 1);
        assert!(written["nodes"][0]["serialLog"]
            .as_str()
            .unwrap()
            .ends_with("server0.log"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
