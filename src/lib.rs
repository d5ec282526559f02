//! Process lifecycle and queue-eviction manager for a compute accelerator driver.
//!
//! A [`Kfd`] tracks one [`KfdProcess`] per user address space that opened the driver.
//! It hands out PASIDs, builds per-device state, evicts and restores user-mode queues
//! on behalf of the memory manager, and tears everything down in two phases when the
//! address space exits.

pub mod config;
pub mod error;
pub mod kfd;
pub mod mm;
pub mod process;
pub mod sync;
pub mod utils;

pub use config::ProcessConfig;
pub use error::{KfdError, KfdResult};
pub use process::{Kfd, KfdProcess, ProcessRef};
