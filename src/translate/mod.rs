//! Translation between the client protocols and the Cloud Code / Codex backends.
//!
//! Every client request is lowered into canonical messages and then into the
//! backend's `generateContent` shape; replies and streams are raised back into
//! the caller's protocol. All translation functions are pure (no I/O).

pub mod anthropic;
pub mod anthropic_types;
pub mod canonical;
pub mod codex;
pub mod gemini_types;
pub mod genai;
pub mod openai_chat;
pub mod openai_types;
pub mod responses;
pub mod responses_types;
pub mod streaming;
