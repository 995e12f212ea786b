//! Public types for the bifrost middleware contract.

mod params;
mod prompt;
mod request;
mod response;
mod stream;

pub use params::{AbortSignal, GenerateParams, ModelHandle, RateLimitContext};
pub use prompt::{Message, Role, ToolDefinition};
pub use request::ModelRequest;
pub use response::{ContentPart, FinishReason, GenerateResult, Usage};
pub use stream::{PartStream, StreamPart};
