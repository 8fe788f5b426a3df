#![warn(missing_docs)]
//! In-process transport and reporting surfaces for exercising connections without a
//! network.

mod broker;
mod recording;
mod report;

pub use broker::*;
pub use recording::*;
pub use report::*;
