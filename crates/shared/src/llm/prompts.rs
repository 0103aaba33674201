pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and considerate AI assistant. You can analyze documents and answer questions about them. Answer clearly and in a structured way.";

pub const DEFAULT_MAX_TOKENS: u32 = 4000;

/// Header placed before the wrapped file blocks in the synthetic context turn.
pub const ATTACHMENT_CONTEXT_HEADER: &str = "Files provided as context:";
