//! Remote sample manifests, downloaded once and served from a local cache afterwards.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

#[async_trait::async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self, url: &str, cache_name: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl HttpFetcher {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, cache_dir })
    }

    pub fn cache_dir(&self) -> &Path { &self.cache_dir }

    async fn download(&self, url: &str) -> Result<String> {
        let t0 = Instant::now();
        let resp = self.client.get(url).send().await.with_context(|| format!("fetching {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("fetching {}: HTTP {}", url, status);
        }
        let body = resp.text().await.with_context(|| format!("reading body of {}", url))?;
        info!(url, bytes = body.len(), took_ms = %t0.elapsed().as_millis(), "remote manifest downloaded");
        Ok(body)
    }
}

#[async_trait::async_trait]
impl ManifestFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, cache_name: &str) -> Result<String> {
        let path = self.cache_dir.join(cache_name);
        if let Ok(body) = tokio::fs::read_to_string(&path).await {
            debug!(path = %path.display(), "using cached manifest");
            return Ok(body);
        }
        let body = self.download(url).await?;
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("creating cache dir {}", self.cache_dir.display()))?;
        tokio::fs::write(&path, &body).await.with_context(|| format!("caching manifest at {}", path.display()))?;
        Ok(body)
    }
}
