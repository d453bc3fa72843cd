//! Translation between the caller-facing OpenAI dialect and the upstream
//! Mammouth wire format.

pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod upstream;
