//! Upstream model implementations.

pub mod backpressure;
mod openai;
mod router;
pub mod sse;

pub use backpressure::{DEFAULT_STREAM_BUFFER, bounded_stream};
pub use openai::OpenAiCompatibleModel;
pub use router::ProviderRouter;
