pub mod anthropic;
pub mod gemini;
pub mod openai_chat;
pub mod openai_responses;
