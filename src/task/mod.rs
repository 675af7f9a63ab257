//! Task-level types: the input data model (§3), the per-container handle
//! (§4.5), the store that maps task ids to handles (§4.4), and the pure
//! builder that turns a spec into engine create-parameters (§4.6).

mod builder;
mod handle;
mod spec;
mod store;

pub use builder::{ContainerBuilder, ALLOC_ID_LABEL};
pub use handle::{
    ExecResult, ExecStreamingOptions, ExitResult, HandleState, LogSidecarHandle, NetworkMetadata, TaskHandle,
    TaskHandleBlob, TASK_HANDLE_BLOB_VERSION,
};
pub use spec::{
    AuthConfig, LoggingSelector, MountKind, PortMapping, TaskDns, TaskMount, TaskNetwork, TaskResources, TaskSpec,
    Ulimit,
};
pub use store::TaskStore;
