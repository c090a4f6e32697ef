pub mod feed;
pub mod lease;
pub mod sink;
pub mod state;

pub use feed::{Appender, ChangeFeed};
pub use lease::LeaseStore;
pub use sink::{DeadLetterSink, DownstreamSink};
pub use state::{ContinuationStore, ViewStore};
