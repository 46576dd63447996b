//! Langbase Pipes HTTP transport used by the oracle.

mod client;
mod types;

pub use client::LangbaseClient;
pub use types::{
    CreatePipeRequest, CreatePipeResponse, Message, MessageRole, PipeRequest, PipeResponse,
    RawResponse, Usage,
};
