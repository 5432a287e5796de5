//! Concrete storage backends

pub mod file;
pub mod local_cpu;
pub mod transfer;

pub use file::{FileBackend, FileBackendConfig, FileMedium};
pub use local_cpu::LocalCPUBackend;
pub use transfer::{DirectTransfer, PosixTransfer};
