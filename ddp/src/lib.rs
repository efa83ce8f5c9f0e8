pub mod backend;
pub mod config;
pub mod device;
pub mod env;
pub mod errors;
pub mod launcher;
pub mod observability;
pub mod process_group;
pub mod source;
pub mod tensor;
pub mod transport;

pub use backend::{Backend, BackendSelector, Platform, TransportFactory};
pub use config::{LaunchArgs, LauncherConfig, LoggingConfig, Rendezvous};
pub use device::{CpuOnly, DeviceManager};
pub use env::{EnvStore, MemoryEnv, ProcessEnv};
pub use errors::{DdpError, Result};
pub use launcher::{broadcast_params, cleanup, init_processes, Launcher, WorkerContext};
pub use process_group::ProcessGroup;
pub use source::copy_source;
pub use tensor::Tensor;
pub use transport::{ReduceOp, TcpTransport, TcpTransportFactory, Transport};
