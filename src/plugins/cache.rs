use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use md5::{Digest, Md5};
use tracing::{debug, info};

use crate::http::HttpClient;

/// A spider artifact reference: `url[;md5;checksum]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub url: String,
    pub checksum: Option<String>,
}

impl ArtifactRef {
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.trim().split(';').collect();
        let checksum = match parts.as_slice() {
            [_, kind, sum, ..] if kind.eq_ignore_ascii_case("md5") && !sum.trim().is_empty() => {
                Some(sum.trim().to_ascii_lowercase())
            }
            _ => None,
        };
        Self { url: parts[0].trim().to_string(), checksum }
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// On-disk cache of downloaded spider artifacts, keyed by URL.
pub struct SpiderCache {
    dir: PathBuf,
    http: Arc<dyn HttpClient>,
}

impl SpiderCache {
    pub fn new(dir: PathBuf, http: Arc<dyn HttpClient>) -> Self {
        Self { dir, http }
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("spider_{}.bin", md5_hex(url.as_bytes())))
    }

    /// Artifact bytes for `raw`. A cached copy is reused only when the
    /// reference carries a checksum and the copy matches it.
    pub async fn fetch(&self, raw: &str) -> Result<Vec<u8>> {
        let r = ArtifactRef::parse(raw);
        if r.url.is_empty() { return Err(anyhow!("empty spider reference")); }
        let path = self.path_for(&r.url);

        if let Some(sum) = &r.checksum {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if md5_hex(&bytes) == *sum {
                    debug!("spider cache hit {}", path.display());
                    return Ok(bytes);
                }
            }
        }

        let bytes = match r.url.strip_prefix("file://") {
            Some(local) => tokio::fs::read(local).await.with_context(|| format!("reading {}", local))?,
            None => self.http.get_bytes(&r.url, &Vec::new()).await.with_context(|| format!("downloading spider {}", r.url))?,
        };
        if let Some(sum) = &r.checksum {
            let got = md5_hex(&bytes);
            if got != *sum {
                return Err(anyhow!("spider {} checksum mismatch: expected {}, got {}", r.url, sum, got));
            }
        }
        if let Err(e) = self.store(&path, &bytes).await {
            debug!("could not cache spider {}: {:#}", r.url, e);
        } else {
            info!("cached spider {} ({} bytes)", r.url, bytes.len());
        }
        Ok(bytes)
    }

    async fn store(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Remove every cached artifact.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("spider_") && name.ends_with(".bin") {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
