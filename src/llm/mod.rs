//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），以及思考阶段使用的推理预言机

pub mod mock;
pub mod openai;
pub mod reasoner;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use reasoner::{create_reasoner_from_config, LlmReasoner};
pub use traits::{LlmClient, LlmError, Message, Reasoner, ReasoningTier, Role};
