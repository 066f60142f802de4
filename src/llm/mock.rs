//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 取最后一条 User 消息的首行，生成一段固定结构的推理文本，便于本地跑通思考流程。

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// Mock 客户端：基于用户最后一条消息生成确定性推理
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let headline = last_user.lines().next().unwrap_or("").trim();

        Ok(format!(
            "Reasoning for {headline}. The task should run once its prerequisites are confirmed.\n\
             - Ensure every dependency output is available before dispatch\n\
             - Consider the time budget and keep the execution focused\n\
             - Verify the result shape before reporting completion"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_uses_last_user_message() {
        let client = MockLlmClient;
        let out = client
            .complete(&[Message::system("sys"), Message::user("Task: load\nmore")])
            .await
            .unwrap();
        assert!(out.starts_with("Reasoning for Task: load."));
        assert!(out.contains("- Ensure"));
    }
}
