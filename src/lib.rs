//! Bifrost - composable middleware gateway for LLM requests
//!
//! A [`ModelChain`] wraps an upstream [`LanguageModel`] in an ordered list
//! of [`Middleware`]. The standard chain adds:
//!
//! - per-class rate limiting with provider failover and request queueing
//!   ([`rate_limit`])
//! - a two-tier response cache with a jail graduation policy ([`cache`])
//! - online stream assembly and chat persistence ([`assembler`],
//!   [`persistence`])
//! - a control-plane protocol to collect and restore middleware state
//!   ([`state`])
//!
//! Upstream calls share a [`Semaphore`] that bounds outbound concurrency.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bifrost::{
//!     ChainBuilder, Collaborators, GatewayConfig, GenerateParams, MemoryChatStore,
//!     MemoryQueue, ModelHandle, ModelRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> bifrost::Result<()> {
//!     let config = GatewayConfig::load_or_default(None)?;
//!     let chain = ChainBuilder::from_config(
//!         &config,
//!         Collaborators {
//!             registry: Arc::new(ModelRegistry::with_embedded_seed()),
//!             queue: Arc::new(MemoryQueue::new()),
//!             chat_store: Arc::new(MemoryChatStore::new()),
//!             network_cache: None,
//!         },
//!     )?
//!     .build()?;
//!
//!     let handle = ModelHandle::new("openai", "gpt-4.1", "hifi");
//!     let result = chain
//!         .generate(&handle, GenerateParams::from_prompt("What is the capital of France?"))
//!         .await?;
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod persistence;
pub mod providers;
pub mod rate_limit;
pub mod registry;
pub mod semaphore;
pub mod state;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use assembler::{ProcessingQueue, StreamHandlerContext};
pub use cache::{CacheConfig, CacheMiddleware, CachedFetch, ResponseCache};
pub use config::GatewayConfig;
pub use error::{BifrostError, Result};
pub use gateway::{ChainBuilder, Collaborators, ModelChain};
pub use middleware::{Middleware, Next};
pub use persistence::{
    ChatContext, ChatStore, FlushConfig, FlushHandlers, MemoryChatStore, PersistenceMiddleware,
};
pub use providers::{OpenAiCompatibleModel, ProviderRouter};
pub use rate_limit::{MemoryQueue, QueueManager, RateLimitConfig, RateLimitMiddleware};
pub use registry::ModelRegistry;
pub use semaphore::{Semaphore, SemaphorePermit};
pub use state::{StateData, StateEntry, StateValue};
pub use traits::LanguageModel;
pub use types::{
    AbortSignal, ContentPart, FinishReason, GenerateParams, GenerateResult, Message,
    ModelHandle, ModelRequest, PartStream, RateLimitContext, Role, StreamPart,
    ToolDefinition, Usage,
};
