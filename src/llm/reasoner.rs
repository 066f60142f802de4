//! 推理预言机实现
//!
//! LlmReasoner 把 prompt 包成 system + user 两条消息，按档位选择标准 / 高级客户端，
//! 整个调用受超时约束。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AppConfig, ReasonerSection};
use crate::llm::{LlmClient, LlmError, Message, MockLlmClient, OpenAiClient, Reasoner, ReasoningTier};

const SYSTEM_PROMPT: &str = "You plan the next step of an automated task pipeline. \
Answer with one short paragraph of reasoning followed by a bullet list of considerations, \
one per line, each starting with '- '.";

/// 基于 LlmClient 的推理预言机
pub struct LlmReasoner {
    standard: Arc<dyn LlmClient>,
    advanced: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmReasoner {
    pub fn new(standard: Arc<dyn LlmClient>, advanced: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self {
            standard,
            advanced,
            timeout,
        }
    }

    /// 两个档位共用同一个客户端
    pub fn single(client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self::new(client.clone(), client, timeout)
    }

    fn client(&self, tier: ReasoningTier) -> &Arc<dyn LlmClient> {
        match tier {
            ReasoningTier::Standard => &self.standard,
            ReasoningTier::Advanced => &self.advanced,
        }
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn generate(&self, prompt: &str, tier: ReasoningTier) -> Result<String, LlmError> {
        let messages = [Message::system(SYSTEM_PROMPT), Message::user(prompt)];
        match tokio::time::timeout(self.timeout, self.client(tier).complete(&messages)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// 根据配置创建推理预言机：provider = "openai" 时走 OpenAI 兼容端点，否则用 Mock
pub fn create_reasoner_from_config(cfg: &AppConfig) -> Arc<dyn Reasoner> {
    let section: &ReasonerSection = &cfg.reasoner;
    let timeout = Duration::from_secs(section.timeout_secs.max(1));

    match section.provider.as_str() {
        "openai" => {
            let base_url = section.base_url.as_deref();
            let standard: Arc<dyn LlmClient> =
                Arc::new(OpenAiClient::new(base_url, &section.model, None));
            let advanced: Arc<dyn LlmClient> = match section.advanced_model.as_deref() {
                Some(model) => Arc::new(OpenAiClient::new(base_url, model, None)),
                None => standard.clone(),
            };
            tracing::info!(model = %section.model, "Using OpenAI-compatible reasoner");
            Arc::new(LlmReasoner::new(standard, advanced, timeout))
        }
        other => {
            if other != "mock" {
                tracing::warn!(provider = %other, "Unknown reasoner provider, falling back to mock");
            }
            Arc::new(LlmReasoner::single(Arc::new(MockLlmClient), timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    struct TaggedClient(&'static str);

    #[async_trait]
    impl LlmClient for TaggedClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let reasoner = LlmReasoner::single(Arc::new(SlowClient), Duration::from_millis(20));
        let err = reasoner.generate("x", ReasoningTier::Standard).await.unwrap_err();
        assert_eq!(err, LlmError::Timeout(0));
    }

    #[tokio::test]
    async fn test_tier_selects_client() {
        let reasoner = LlmReasoner::new(
            Arc::new(TaggedClient("standard")),
            Arc::new(TaggedClient("advanced")),
            Duration::from_secs(1),
        );
        assert_eq!(reasoner.generate("x", ReasoningTier::Standard).await.unwrap(), "standard");
        assert_eq!(reasoner.generate("x", ReasoningTier::Advanced).await.unwrap(), "advanced");
    }

    #[tokio::test]
    async fn test_mock_provider_from_default_config() {
        let reasoner = create_reasoner_from_config(&AppConfig::default());
        let out = reasoner.generate("Task: demo", ReasoningTier::Standard).await.unwrap();
        assert!(out.contains("Task: demo"));
    }
}
