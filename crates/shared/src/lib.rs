pub mod attachments;
pub mod config;
mod config_env;
pub mod conversation;
pub mod llm;
pub mod models;
pub mod relay;
pub mod repos;
pub mod session;
