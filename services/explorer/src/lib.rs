pub mod api;
pub mod config;
pub mod deadline;
pub mod demo;
pub mod epochs;
pub mod review;
pub mod transport;
pub mod transport_axum;

pub use api::{
    AccumulatedEdits, DecisionCount, Explorer, ExplorerError, ExplorerOptions, UserReviewCount,
};
pub use config::{ExplorerConfig, StoreBackend};
pub use epochs::{EpochLookup, EpochResolver, RefreshPolicy};
pub use review::{AntiJoinPolicy, ReviewStatusResolver, UnreviewedStrategy};
