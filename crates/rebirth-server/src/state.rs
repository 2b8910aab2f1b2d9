use std::sync::Arc;

use anyhow::Result;

use rebirth::config::Settings;
use rebirth::engine::state::ChapterConfig;
use rebirth::engine::{StoryEngine, StoryGenerator};
use rebirth::images::ImageService;
use rebirth::priming::FirstStoryCache;
use rebirth::providers::chat::OpenAiCompatProvider;
use rebirth::providers::llm::LlmClient;
use rebirth::speculation::{SpeculationConfig, SpeculationService};
use rebirth::storage::StoryStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: StoryStore,
    pub generator: Arc<dyn StoryGenerator>,
    pub llm: Arc<LlmClient>,
    pub speculation: Arc<SpeculationService>,
    pub priming: Arc<FirstStoryCache>,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        store: StoryStore,
        generator: Arc<dyn StoryGenerator>,
        llm: Arc<LlmClient>,
        speculation: Arc<SpeculationService>,
        priming: Arc<FirstStoryCache>,
    ) -> Self {
        Self {
            settings,
            store,
            generator,
            llm,
            speculation,
            priming,
        }
    }

    /// Production wiring: SQLite store, OpenAI-compatible LLM provider,
    /// image pipeline, speculation scheduler, priming cache.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);

        let store = StoryStore::open(&settings.database_path).await?;

        let provider = Arc::new(OpenAiCompatProvider::from_settings(&settings)?);
        let llm = Arc::new(LlmClient::new(provider, &settings));

        let images = Arc::new(ImageService::from_settings(&settings)?);
        let chapter_config = ChapterConfig {
            min_nodes: settings.min_nodes,
            max_nodes: settings.max_nodes,
            pass_threshold: settings.pass_threshold,
            fail_threshold: settings.fail_threshold,
        };
        let generator: Arc<dyn StoryGenerator> =
            Arc::new(StoryEngine::new(llm.clone(), images, chapter_config));

        let speculation = SpeculationService::new(
            SpeculationConfig::from_settings(&settings),
            store.clone(),
            generator.clone(),
        );
        let priming = Arc::new(FirstStoryCache::new(settings.first_story_cache_max_entries));

        Ok(Self::new(settings, store, generator, llm, speculation, priming))
    }
}
