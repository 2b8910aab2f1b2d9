//! Persistence of AI-generated images. Remote results are downloaded once
//! into a content-addressed local file so the URL we hand to clients keeps
//! resolving after the upstream link expires.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

pub struct ImageStorage {
    dir: PathBuf,
    url_prefix: String,
    client: reqwest::Client,
}

impl ImageStorage {
    pub fn new(dir: PathBuf, url_prefix: String) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating image storage dir {}", dir.display()))?;
        Ok(Self {
            dir,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
        })
    }

    /// Download `image_url` into the storage directory and return the local
    /// URL. Repeat calls with the same inputs reuse the existing file.
    /// Non-http(s) inputs are assumed to already be local and pass through.
    pub async fn persist_remote_image(&self, image_url: &str, context: &str) -> Result<String> {
        if !image_url.starts_with("http://") && !image_url.starts_with("https://") {
            return Ok(image_url.to_string());
        }

        let filename = generated_filename(image_url, context);
        let local_path = self.dir.join(&filename);
        let web_url = format!("{}/{}", self.url_prefix, filename);

        if local_path.exists() {
            tracing::debug!(%filename, "generated image already persisted");
            return Ok(web_url);
        }

        let response = self.client.get(image_url).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        if !content_type.starts_with("image/") {
            bail!("URL did not return an image (content-type: {content_type})");
        }

        let bytes = response.bytes().await?;

        // Write to a temp name then rename so a concurrent readiness probe
        // never observes a half-written file.
        let tmp_path = self.dir.join(format!("{filename}.part"));
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &local_path)?;

        tracing::info!(%filename, size = bytes.len(), "generated image persisted");
        Ok(web_url)
    }
}

/// Content-addressed filename: a hash of URL plus a prefix of the story
/// context, so identical generations dedupe while distinct scenes never
/// collide.
pub(crate) fn generated_filename(image_url: &str, context: &str) -> String {
    let context_prefix: String = context.chars().take(100).collect();
    let mut hasher = Sha256::new();
    hasher.update(image_url.as_bytes());
    hasher.update(b"_");
    hasher.update(context_prefix.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

    let extension = extension_from_url(image_url);
    format!("ai_gen_{}{}", &hex[..32], extension)
}

fn extension_from_url(image_url: &str) -> &'static str {
    let path = url::Url::parse(image_url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        ".jpg"
    } else if path.ends_with(".gif") {
        ".gif"
    } else if path.ends_with(".webp") {
        ".webp"
    } else {
        ".png"
    }
}
