//! Wish moderation: a local banned-word table backed by a fast LLM
//! true/false classification. The LLM path fails open — an outage never
//! blocks players whose wish passed the local check.

use once_cell::sync::Lazy;

use crate::providers::llm::{GenerateOptions, LlmClient};

pub const MAX_WISH_CHARS: usize = 100;

static BANNED_WORDS: Lazy<Vec<(&'static str, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        ("暴恐/极端", vec!["恐怖主义", "极端主义", "暴恐", "恐袭"]),
        ("仇恨/歧视", vec!["种族歧视", "仇恨言论"]),
        ("违法犯罪", vec!["毒品", "贩毒", "枪支", "走私", "诈骗"]),
        ("色情", vec!["色情", "淫秽"]),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WishRejection {
    pub reason: String,
    pub category: Option<String>,
}

/// Local length and banned-word check.
pub fn check_wish_basic(wish: &str) -> Result<(), WishRejection> {
    let text = wish.trim();
    if text.is_empty() {
        return Err(WishRejection {
            reason: "重生愿望不能为空".into(),
            category: None,
        });
    }
    if text.chars().count() > MAX_WISH_CHARS {
        return Err(WishRejection {
            reason: "重生愿望过长，请控制在100字以内".into(),
            category: None,
        });
    }

    let lowered = text.to_lowercase();
    for (category, words) in BANNED_WORDS.iter() {
        for word in words {
            if lowered.contains(&word.to_lowercase()) {
                tracing::warn!(%word, %category, "banned word detected in wish");
                return Err(WishRejection {
                    reason: format!("包含敏感词：{word}"),
                    category: Some((*category).to_string()),
                });
            }
        }
    }
    Ok(())
}

/// Full check: local table first, then a minimal-token LLM classification.
/// Anything other than a clear "false" from the model passes.
pub async fn check_wish(llm: &LlmClient, wish: &str) -> Result<(), WishRejection> {
    check_wish_basic(wish)?;

    let text = wish.trim();
    let prompt = format!(
        "判断以下重生愿望是否合适。只能回答'true'或'false'，不要任何解释。\n\n\
         合适标准：积极正面，不涉及违法犯罪、仇恨歧视、色情暴力、自伤他伤等内容。\n\n\
         愿望：{text}\n\n\
         回答（只能是true或false）："
    );

    match llm
        .generate(
            &prompt,
            &[],
            GenerateOptions {
                temperature: Some(0.1),
                max_tokens: Some(10),
                ..Default::default()
            },
        )
        .await
    {
        Ok(response) => {
            let verdict = response.trim().to_lowercase();
            if verdict.contains("false") {
                Err(WishRejection {
                    reason: "愿望内容不合适，请重新输入".into(),
                    category: Some("llm".into()),
                })
            } else {
                if !verdict.contains("true") {
                    tracing::warn!(%response, "unexpected moderation verdict, passing");
                }
                Ok(())
            }
        }
        Err(error) => {
            tracing::error!(%error, "LLM wish moderation failed, falling back to local verdict");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::providers::errors::ProviderError;
    use crate::providers::mock::MockChatProvider;
    use std::sync::Arc;

    fn llm_with(provider: MockChatProvider) -> LlmClient {
        let mut settings = Settings::from_env();
        settings.llm_max_retries = 0;
        settings.llm_retry_backoff_min_ms = 1;
        settings.llm_retry_backoff_max_ms = 1;
        LlmClient::new(Arc::new(provider), &settings)
    }

    #[test]
    fn basic_check_rejects_empty_long_and_banned() {
        assert!(check_wish_basic("   ").is_err());
        assert!(check_wish_basic(&"字".repeat(101)).is_err());

        let rejection = check_wish_basic("我想重生去贩毒").unwrap_err();
        assert_eq!(rejection.category.as_deref(), Some("违法犯罪"));

        assert!(check_wish_basic("李世民").is_ok());
    }

    #[tokio::test]
    async fn llm_verdict_is_honored() {
        let llm = llm_with(MockChatProvider::scripted(vec![Ok("true".into())]));
        assert!(check_wish(&llm, "李世民").await.is_ok());

        let llm = llm_with(MockChatProvider::scripted(vec![Ok("false".into())]));
        let rejection = check_wish(&llm, "李世民").await.unwrap_err();
        assert_eq!(rejection.category.as_deref(), Some("llm"));
    }

    #[tokio::test]
    async fn llm_outage_fails_open() {
        let llm = llm_with(MockChatProvider::always_err(ProviderError::NetworkError(
            "down".into(),
        )));
        assert!(check_wish(&llm, "李世民").await.is_ok());
    }
}
