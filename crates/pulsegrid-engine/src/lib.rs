//! pulsegrid-engine: the PulseGrid ingest and read paths.
//!
//! A score entering [`Engine::ingest`] is appended to the raw log, fanned
//! out to all eight resolutions by the [`FanoutWriter`], patched into the
//! [`ResolutionCache`] and announced through the [`Dispatcher`]. Reads go
//! through the [`QueryService`], which pairs completed buckets with the
//! in-progress one from the [`PartialComputer`].

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod partial;
pub mod pipeline;
pub mod query;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CachedSeries, ResolutionCache, LIVE_END};
pub use dispatch::{
    ConnectionId, DeliveryStats, Dispatcher, EventKind, StreamEvent, Subscription,
    SubscriptionStream,
};
pub use error::{EngineError, EngineResult};
pub use fanout::{fanout, FanoutOutcome, FanoutWriter, RetryPolicy};
pub use partial::PartialComputer;
pub use pipeline::{Engine, IngestReport, PurgeReport};
pub use query::{QueryResult, QueryService};
