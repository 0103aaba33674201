pub mod gateway;
pub mod openrouter;
pub mod prompts;
pub mod sse;

pub use gateway::{
    LlmChatRequest, LlmGateway, LlmGatewayError, LlmMessage, LlmStreamFuture, LlmTokenStream,
};
pub use openrouter::{OpenRouterConfigError, OpenRouterGateway, OpenRouterGatewayConfig};
pub use prompts::{ATTACHMENT_CONTEXT_HEADER, DEFAULT_MAX_TOKENS, DEFAULT_SYSTEM_PROMPT};
pub use sse::{SseEvent, SseLineBuffer};
