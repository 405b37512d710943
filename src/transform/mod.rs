//! Graph transformation - multi-instance expansion, the declarative
//! operation library, and the phase dispatcher that drives them.

pub mod expand;
pub mod ops;
pub mod pipeline;

pub use expand::{expand, Expander};
pub use ops::{Aggregation, Direction, LinkAction, NameGenerator, OpContext, Operation};
pub use pipeline::{CancelToken, Pipeline, PipelineOutput};
