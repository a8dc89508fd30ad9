//! One streaming completion / embedding contract over OpenAI, Qwen (DashScope)
//! and Wenxin (Baidu Qianfan).
//!
//! Provides the `PlatformAdapter` trait, `DynPlatform` wrapper, the three
//! adapters, middleware chain, and `Gateway` for routing calls by platform key.

mod client;
pub mod credentials;
pub mod embedding;
pub mod framer;
pub mod normalize;
mod openai;
mod provider;
mod qwen;
pub mod retry;
pub mod splitter;
pub mod tokens;
mod types;
mod wenxin;

pub use client::*;
pub use openai::{OpenAiAdapter, OPENAI_MODELS};
pub use provider::{resolve_model, DynPlatform, PlatformAdapter};
pub use qwen::{QwenAdapter, QWEN_MODELS};
pub use types::*;
pub use wenxin::{WenxinAdapter, WENXIN_MODELS};

pub use switchboard_types::{GatewayError, PlatformConfig, PlatformKey, Result, SystemConfig};
