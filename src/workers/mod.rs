pub mod batch;
pub mod pool;

pub use batch::{BatchReport, BatchRequest, RegistrationPool, register_batch};
pub use pool::{Task, TaskFailure, TaskResult, WorkerPool};
