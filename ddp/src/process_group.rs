use crate::backend::{Backend, TransportFactory};
use crate::config::Rendezvous;
use crate::errors::{DdpError, Result};
use crate::tensor::Tensor;
use crate::transport::{ReduceOp, Transport};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle on an initialized process group.
///
/// The underlying transport is shut down exactly once: by [`destroy`](Self::destroy)
/// when called, otherwise when the handle is dropped (which includes unwinding
/// out of a panicking user function).
pub struct ProcessGroup {
    backend: Backend,
    rank: usize,
    world_size: usize,
    group_id: Option<Uuid>,
    transport: Mutex<Option<Box<dyn Transport>>>,
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("backend", &self.backend)
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("group_id", &self.group_id)
            .finish()
    }
}

impl ProcessGroup {
    /// Join the group described by `rendezvous` through `factory`.
    pub fn init(
        factory: &dyn TransportFactory,
        rendezvous: &Rendezvous,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(DdpError::InvalidRank { rank, world_size });
        }

        info!(
            backend = %factory.backend(),
            rank,
            world_size,
            endpoint = %rendezvous.endpoint(),
            "Initializing process group"
        );

        let transport = factory.connect(rendezvous, rank, world_size)?;
        let group = Self::from_transport(transport);

        info!(
            backend = %group.backend,
            rank,
            world_size,
            group_id = ?group.group_id,
            "Process group initialized"
        );
        Ok(group)
    }

    /// Wrap an already connected transport.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            backend: transport.backend(),
            rank: transport.rank(),
            world_size: transport.world_size(),
            group_id: transport.group_id(),
            transport: Mutex::new(Some(transport)),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn group_id(&self) -> Option<Uuid> {
        self.group_id
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Overwrite `buffer` on every rank with the copy held by `src`.
    pub fn broadcast(&self, buffer: &mut [f32], src: usize) -> Result<()> {
        self.with_transport(|t| t.broadcast(buffer, src))
    }

    /// Broadcast a tensor's data in place; shapes must agree across ranks.
    pub fn broadcast_tensor(&self, tensor: &mut Tensor, src: usize) -> Result<()> {
        self.broadcast(&mut tensor.data, src)
    }

    pub fn all_reduce(&self, buffer: &mut [f32], op: ReduceOp) -> Result<()> {
        self.with_transport(|t| t.all_reduce(buffer, op))
    }

    pub fn barrier(&self) -> Result<()> {
        debug!(rank = self.rank, "Entering barrier");
        self.with_transport(|t| t.barrier())
    }

    /// Shut the transport down and release the group.
    pub fn destroy(self) -> Result<()> {
        match self.take_transport() {
            Some(mut transport) => {
                let result = transport.shutdown();
                info!(rank = self.rank, backend = %self.backend, "Process group destroyed");
                result
            }
            None => Ok(()),
        }
    }

    fn with_transport<R>(&self, op: impl FnOnce(&mut dyn Transport) -> Result<R>) -> Result<R> {
        let mut guard = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        let transport = guard.as_mut().ok_or(DdpError::ProcessGroupDestroyed)?;
        op(transport.as_mut())
    }

    fn take_transport(&self) -> Option<Box<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(mut transport) = self.take_transport() {
            match transport.shutdown() {
                Ok(()) => info!(rank = self.rank, "Process group released on drop"),
                Err(e) => warn!(rank = self.rank, error = %e, "Failed to shut down process group on drop"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        shutdowns: AtomicUsize,
        barriers: AtomicUsize,
        connects: AtomicUsize,
    }

    struct FakeTransport {
        rank: usize,
        world_size: usize,
        counters: Arc<Counters>,
        fail_shutdown: bool,
    }

    impl FakeTransport {
        fn boxed(rank: usize, world_size: usize, counters: &Arc<Counters>) -> Box<dyn Transport> {
            Box::new(Self {
                rank,
                world_size,
                counters: Arc::clone(counters),
                fail_shutdown: false,
            })
        }
    }

    impl Transport for FakeTransport {
        fn backend(&self) -> Backend {
            Backend::Tcp
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn world_size(&self) -> usize {
            self.world_size
        }

        // Pretend rank `src` holds `src` everywhere
        fn broadcast(&mut self, buffer: &mut [f32], src: usize) -> Result<()> {
            buffer.iter_mut().for_each(|v| *v = src as f32);
            Ok(())
        }

        fn all_reduce(&mut self, buffer: &mut [f32], op: ReduceOp) -> Result<()> {
            if op == ReduceOp::Sum {
                buffer.iter_mut().for_each(|v| *v *= self.world_size as f32);
            }
            Ok(())
        }

        fn barrier(&mut self) -> Result<()> {
            self.counters.barriers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&mut self) -> Result<()> {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                return Err(DdpError::Network("peer gone".into()));
            }
            Ok(())
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
    }

    impl TransportFactory for FakeFactory {
        fn backend(&self) -> Backend {
            Backend::Tcp
        }

        fn probe(&self) -> Result<bool> {
            Ok(true)
        }

        fn connect(&self, _: &Rendezvous, rank: usize, world_size: usize) -> Result<Box<dyn Transport>> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeTransport::boxed(rank, world_size, &self.counters))
        }
    }

    fn rendezvous() -> Rendezvous {
        Rendezvous {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_init_validates_rank() {
        let counters = Arc::new(Counters::default());
        let factory = FakeFactory {
            counters: Arc::clone(&counters),
        };

        let err = ProcessGroup::init(&factory, &rendezvous(), 4, 4).unwrap_err();
        assert!(matches!(err, DdpError::InvalidRank { rank: 4, world_size: 4 }));

        let err = ProcessGroup::init(&factory, &rendezvous(), 0, 0).unwrap_err();
        assert!(matches!(err, DdpError::InvalidRank { .. }));

        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_init_and_accessors() {
        let counters = Arc::new(Counters::default());
        let factory = FakeFactory {
            counters: Arc::clone(&counters),
        };

        let group = ProcessGroup::init(&factory, &rendezvous(), 2, 3).unwrap();
        assert_eq!(group.rank(), 2);
        assert_eq!(group.world_size(), 3);
        assert_eq!(group.backend(), Backend::Tcp);
        assert_eq!(group.group_id(), None);
        assert!(!group.is_main_process());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collectives_delegate_to_transport() {
        let counters = Arc::new(Counters::default());
        let group = ProcessGroup::from_transport(FakeTransport::boxed(1, 4, &counters));

        let mut tensor = Tensor::filled(vec![2, 2], 9.0);
        group.broadcast_tensor(&mut tensor, 0).unwrap();
        assert_eq!(tensor.data, vec![0.0; 4]);

        let mut buffer = vec![1.0, 2.0];
        group.all_reduce(&mut buffer, ReduceOp::Sum).unwrap();
        assert_eq!(buffer, vec![4.0, 8.0]);

        group.barrier().unwrap();
        assert_eq!(counters.barriers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_shuts_down_once() {
        let counters = Arc::new(Counters::default());
        let group = ProcessGroup::from_transport(FakeTransport::boxed(0, 2, &counters));

        group.destroy().unwrap();
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_shuts_down_once() {
        let counters = Arc::new(Counters::default());
        drop(ProcessGroup::from_transport(FakeTransport::boxed(0, 2, &counters)));
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_still_releases_group() {
        let counters = Arc::new(Counters::default());
        let group = ProcessGroup::from_transport(FakeTransport::boxed(0, 2, &counters));

        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let _group = group;
            panic!("training diverged");
        }));

        assert!(result.is_err());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_reports_shutdown_error() {
        let counters = Arc::new(Counters::default());
        let transport = Box::new(FakeTransport {
            rank: 1,
            world_size: 2,
            counters: Arc::clone(&counters),
            fail_shutdown: true,
        });
        let group = ProcessGroup::from_transport(transport);

        assert!(matches!(group.destroy(), Err(DdpError::Network(_))));
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }
}
