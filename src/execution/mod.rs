//! Order execution: the swap client seam and the retrying pipeline on top of it.

pub mod client;
pub mod jupiter;
pub mod paper;
pub mod pipeline;

pub use client::SwapClient;
pub use jupiter::JupiterClient;
pub use paper::{PaperClient, PaperConfig};
pub use pipeline::ExecutionPipeline;
