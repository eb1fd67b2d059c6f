//! Cross-process building blocks: typed shared memory objects and the
//! queues laid out inside them.

pub mod shmem;
pub mod spsc;
