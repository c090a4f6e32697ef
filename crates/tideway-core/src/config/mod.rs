pub mod processor;
pub mod store;

pub use processor::{DispatchConfig, ProcessorConfig, StartPosition};
pub use store::{SqliteConfig, SynchronousMode};
