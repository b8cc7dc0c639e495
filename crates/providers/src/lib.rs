//! Model service implementations for Colloquy.
//!
//! All services implement the `colloquy_core::ChatModel` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiChatModel;
