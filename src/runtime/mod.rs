pub mod exec;
pub mod llamacpp;
pub mod models;
pub mod supervisor;

pub use exec::{run_with_timeout, ExecError, ExecOutput, DEFAULT_EXEC_TIMEOUT};
pub use llamacpp::LoadParams;
pub use models::{
    LoadRequest, LoadResponse, LocalModelManager, ModelError, ModelManager, ModelManagerConfig,
    ModelSummary, ScanIssue, ScanReport,
};
pub use supervisor::{
    LocalProcessSupervisor, ManagedProcess, ProcessListing, ProcessSpec, ProcessSupervisor,
    SupervisorError,
};
