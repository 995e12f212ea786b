//! Model chains: ordered middleware over a terminal provider call.

mod builder;
mod chain;

pub use builder::{ChainBuilder, Collaborators};
pub use chain::ModelChain;
