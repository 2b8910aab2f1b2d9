pub mod api_client;
pub mod chat;
pub mod errors;
pub mod llm;

#[cfg(test)]
pub mod mock;
