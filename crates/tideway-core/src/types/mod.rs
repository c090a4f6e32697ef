pub mod dead_letter;
pub mod lease;
pub mod record;
pub mod view;

pub use dead_letter::DeadLetter;
pub use lease::Lease;
pub use record::{Batch, ChangeRecord, FeedPage, PartitionId, ResumeToken};
pub use view::{AggregateView, Delta, VersionTag};
