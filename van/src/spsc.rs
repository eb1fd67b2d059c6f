//! Single-producer single-consumer ring shared by the device queues.
//!
//! The algorithm lives in [`ring`]; [`crate::ipc::spsc`] places it in shared
//! memory.

pub(crate) mod ring;
