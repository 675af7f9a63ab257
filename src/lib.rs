//! Container task driver library.
//!
//! Composes a typed engine façade, an image-pull coordinator, a
//! container-spec builder, a per-task handle, and a network-sandbox
//! registry behind one `LifecycleController` that a host process (a
//! Nomad-style task driver plugin) drives.

pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod network;
pub mod task;

pub use error::{DriverError, DriverResult};
pub use lifecycle::{LifecycleController, NetworkSandbox};
