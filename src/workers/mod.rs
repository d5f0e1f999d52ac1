pub mod queue_worker;

pub use queue_worker::{process_next_batch, queue_worker_loop};
