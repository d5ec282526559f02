pub mod fence;
pub mod srcu;
pub mod workqueue;

pub use fence::DmaFence;
pub use srcu::{Srcu, SrcuReadGuard};
pub use workqueue::{DelayedWork, WorkQueue};
