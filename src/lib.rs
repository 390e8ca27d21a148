//! # qianfan
//!
//! A Rust client for the Baidu Qianfan large-model inference platform.
//!
//! Each capability client (chat, completion, embedding, text-to-image, image
//! understanding, reranking, plugins) runs its calls through one pipeline
//! that handles authentication, credential refresh, endpoint resolution,
//! client-side rate limiting, retry with backoff, and SSE stream parsing.
//!
//! ```rust,no_run
//! use qianfan::{ChatRequest, Message, Qianfan};
//!
//! # async fn run() -> qianfan::Result<()> {
//! let client = Qianfan::builder().with_app_key("ak", "sk").build()?;
//! let chat = client.chat();
//!
//! let response = chat
//!     .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
//!     .await?;
//! println!("{}", response.result);
//!
//! let mut stream = chat
//!     .stream(ChatRequest::new(vec![Message::user("tell me a story")]))
//!     .await?;
//! while let Some(event) = stream.recv().await {
//!     print!("{}", event?.result);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Credentials and tuning come from, in increasing precedence: built-in
//! defaults, the dotfile, `QIANFAN_*` environment variables, and the
//! builder/[`config::set`] programmatic layer.

mod auth;
pub mod chat;
mod client;
pub mod completion;
pub mod config;
mod console;
mod endpoints;
pub mod embedding;
mod error;
pub mod image2text;
pub mod limiter;
pub mod model;
mod pipeline;
pub mod plugin;
pub mod reranker;
pub mod retry;
mod signer;
pub mod text2image;
mod tokens;
pub mod transport;

pub use tokio_util::sync::CancellationToken;

pub use chat::{ChatCompletion, ChatRequest, ChatResponse};
pub use client::{Qianfan, QianfanBuilder};
pub use completion::{Completion, CompletionRequest, CompletionResponse};
pub use config::ConfigOverrides;
pub use embedding::{Embedding, EmbeddingRequest, EmbeddingResponse};
pub use error::{Error, Result};
pub use image2text::{Image2Text, Image2TextRequest, Image2TextResponse};
pub use limiter::{LimitParams, MemoryStore, SharedStore};
pub use model::{Capability, Function, FunctionCall, Message, Role, SearchInfo, Usage};
pub use plugin::{Plugin, PluginRequest, PluginResponse};
pub use reranker::{Reranker, RerankerRequest, RerankerResponse};
pub use text2image::{Text2Image, Text2ImageRequest, Text2ImageResponse};
pub use tokens::{estimate_messages, estimate_tokens, truncate_messages};
pub use transport::{ResponseEnvelope, ResponseStream, SseStream};
