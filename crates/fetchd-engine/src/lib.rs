//! Execution plane for fetchd.
//!
//! - `registry` - thread-safe job lifecycle records
//! - `driver` - external downloader invocation and progress protocol
//! - `queue` - bounded worker pool with cancellation
//! - `batch` - multi-URL coordination with stop-on-error
//! - `expander` - channel/playlist listing expansion
//! - `executor` - the per-job execution pipeline
//! - `service` - the facade composing all of the above

pub mod batch;
pub mod driver;
pub mod executor;
pub mod expander;
pub mod queue;
pub mod registry;
pub mod service;

pub use batch::{BatchCoordinator, ChildSpec};
pub use driver::YtDlpDriver;
pub use executor::JobExecutor;
pub use expander::Expander;
pub use queue::{ExecutionQueue, JobWork, QueueStats, TerminalWaiter};
pub use registry::{JobFilter, JobRegistry, RegistryStats};
pub use service::{Service, ServiceStats};
