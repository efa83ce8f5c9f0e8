//! Collective transports
//!
//! A [`Transport`] is the connected, per-rank end of a process group. The
//! crate ships one implementation, [`TcpTransport`], a socket-based
//! fallback that routes every collective through rank 0:
//!
//! ```text
//!            ┌────────┐
//!      ┌────►│ rank 0 │◄────┐
//!      │     └────────┘     │
//!      ▼          ▲         ▼
//! ┌────────┐      │    ┌────────┐
//! │ rank 1 │      ▼    │ rank 3 │
//! └────────┘  ┌────────┐└────────┘
//!             │ rank 2 │
//!             └────────┘
//! ```
//!
//! Accelerated transports (NCCL and friends) plug in through
//! [`TransportFactory`](crate::backend::TransportFactory).

pub mod tcp;
pub mod wire;

pub use tcp::{TcpTransport, TcpTransportFactory};

use crate::backend::Backend;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reduction applied by [`Transport::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum over all ranks
    Sum,
    /// Element-wise sum divided by the world size
    Mean,
}

/// Connected endpoint of a process group.
///
/// Every method except [`shutdown`](Transport::shutdown) is a collective:
/// all ranks must call it in the same order with compatible arguments.
pub trait Transport: Send {
    fn backend(&self) -> Backend;

    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Identifier shared by every member of the group, if the backend has one.
    fn group_id(&self) -> Option<Uuid> {
        None
    }

    /// Overwrite `buffer` on every rank with the contents held by `src`.
    fn broadcast(&mut self, buffer: &mut [f32], src: usize) -> Result<()>;

    /// Reduce `buffer` element-wise across ranks, leaving the result everywhere.
    fn all_reduce(&mut self, buffer: &mut [f32], op: ReduceOp) -> Result<()>;

    /// Block until every rank has reached the barrier.
    fn barrier(&mut self) -> Result<()>;

    /// Release connections. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<()>;
}
