//! Transform and load stages of a partition run.
//!
//! Each stage is a plain function (or, for loading, a small struct over a
//! [`TargetStore`](crate::store::TargetStore)) so the orchestrator can run them
//! strictly in sequence and attribute failures to a stage.

pub mod aggregate;
pub mod load;
pub mod normalize;
pub mod resolve;

pub use aggregate::{aggregate, summarize_by_metric, Aggregation, BucketStat, Summary};
pub use load::{LoadError, Loader};
pub use normalize::{normalize, NormalizedRow};
pub use resolve::{resolve, Resolution};
