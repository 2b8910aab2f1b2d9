//! Scene images: AI generation with a pre-shipped library as the always-on
//! fallback. Failures in this pipeline are never surfaced to a player; the
//! worst case is a random library image.

mod generation;
mod storage;

pub use generation::{ImageGenerator, OneApiImageClient};
pub use storage::ImageStorage;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::config::Settings;

static DIRECT_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s)]+\.(?:png|jpg|jpeg|gif|webp)").expect("valid url regex")
});
static ANY_HTTP_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://[^\s)]+").expect("valid url regex"));

pub struct ImageService {
    generator: Option<Arc<dyn ImageGenerator>>,
    storage: ImageStorage,
    library: Vec<String>,
    base_url: String,
}

impl ImageService {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let generator: Option<Arc<dyn ImageGenerator>> = if settings.enable_ai_image_generation {
            Some(Arc::new(OneApiImageClient::from_settings(settings)?))
        } else {
            None
        };
        Ok(Self::new(
            generator,
            ImageStorage::new(
                settings.generated_image_dir.clone(),
                format!("{}/static/generated", settings.public_base_url()),
            )?,
            &settings.image_library_dir,
            settings.public_base_url(),
        ))
    }

    pub fn new(
        generator: Option<Arc<dyn ImageGenerator>>,
        storage: ImageStorage,
        library_dir: &Path,
        base_url: String,
    ) -> Self {
        let library = load_image_library(library_dir);
        tracing::info!(
            count = library.len(),
            dir = %library_dir.display(),
            "image library loaded"
        );
        Self {
            generator,
            storage,
            library,
            base_url,
        }
    }

    /// AI first when enabled, library otherwise; any failure along the AI
    /// path silently falls back to a random library image.
    pub async fn get_image_for_story(&self, story_text: &str) -> String {
        let Some(generator) = &self.generator else {
            return self.random_library_image();
        };

        match self.generate_and_persist(generator, story_text).await {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%error, "AI image generation failed, using library image");
                self.random_library_image()
            }
        }
    }

    async fn generate_and_persist(
        &self,
        generator: &Arc<dyn ImageGenerator>,
        story_text: &str,
    ) -> anyhow::Result<String> {
        let prompt = build_image_prompt(story_text);
        let response = generator.generate(&prompt).await?;
        let remote_url = extract_image_url(&response)
            .ok_or_else(|| anyhow::anyhow!("no image URL in generator response"))?;
        self.storage
            .persist_remote_image(&remote_url, story_text)
            .await
    }

    pub fn random_library_image(&self) -> String {
        match self.library.choose(&mut rand::thread_rng()) {
            Some(filename) => format!("{}/static/{}", self.base_url, filename),
            None => {
                tracing::error!("image library is empty, returning error placeholder");
                format!("{}/static/error_placeholder.png", self.base_url)
            }
        }
    }
}

fn load_image_library(dir: &Path) -> Vec<String> {
    const EXCLUDED: [&str; 2] = ["error_placeholder.png", "README.md"];

    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!(dir = %dir.display(), "image library directory missing");
        return Vec::new();
    };

    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            let lower = name.to_lowercase();
            (lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg"))
                && !EXCLUDED.contains(&name.as_str())
        })
        .collect();
    files.sort();
    files
}

fn build_image_prompt(story_text: &str) -> String {
    let excerpt: String = story_text.chars().take(500).collect();
    format!(
        "Create a cinematic and atmospheric image that captures the essence of this story scene: {excerpt}. Style: detailed, dramatic lighting, high quality."
    )
}

/// Pull an image URL out of a model reply: direct image links win, any http
/// URL is the fallback.
fn extract_image_url(response: &str) -> Option<String> {
    if let Some(found) = DIRECT_IMAGE_URL.find(response) {
        return Some(found.as_str().to_string());
    }
    ANY_HTTP_URL
        .find(response)
        .map(|found| found.as_str().to_string())
}
