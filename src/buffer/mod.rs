pub mod batch;
pub mod queue;

pub use batch::EventBatch;
pub use queue::LatencyQueues;
