mod collector;
mod error;

pub use collector::{InvocationSample, KindStats, SessionStats, StatsCollector};
pub use error::StatsError;
