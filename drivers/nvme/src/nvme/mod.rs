//! NVMe 队列对协议

pub mod command;
pub mod controller;
pub mod queue;
pub mod regs;
pub mod setup;

pub use command::{CompletionEntry, QueueFlags, SubmissionEntry};
pub use controller::{Controller, ControllerInfo, DoorbellMapper, NamespaceInfo};
pub use queue::{CompletionQueue, SubmissionQueue};
pub use setup::QueuePair;
