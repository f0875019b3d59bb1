//! 核心编排层：错误与通知、状态投影、进行中操作登记、工作池、关闭处理、编排器

pub mod error;
pub mod notice;
pub mod orchestrator;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::ErrorKind;
pub use notice::{Notice, NoticePolicy};
pub use orchestrator::{create_orchestrator, Orchestrator, RefreshResults};
pub use registry::{InFlightRegistry, OperationGuard, OperationKind};
pub use shutdown::ShutdownManager;
pub use state::{ActivationEvent, ActivationPhase, AppView, Verb};
pub use task_scheduler::WorkerPool;
