//! Worker bootstrap: pick a backend, join the group, run, tear down

use crate::backend::{BackendSelector, Platform, TransportFactory};
use crate::config::{LaunchArgs, Rendezvous};
use crate::device::{select_device, CpuOnly, DeviceManager};
use crate::env::{EnvStore, ProcessEnv, MASTER_ADDR, MASTER_PORT};
use crate::errors::{DdpError, Result};
use crate::process_group::ProcessGroup;
use crate::tensor::Tensor;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the user function gets to see about its place in the group.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    /// Global rank, as passed to the launcher
    pub rank: usize,
    /// Number of ranks in the group; 1 without a process group
    pub world_size: usize,
    /// Device index this worker asked for
    pub gpu: usize,
    /// Device actually selected, if an accelerator with that index exists
    pub device: Option<usize>,
    pub args: &'a LaunchArgs,
    group: Option<&'a ProcessGroup>,
}

impl<'a> WorkerContext<'a> {
    pub fn group(&self) -> Option<&'a ProcessGroup> {
        self.group
    }

    pub fn is_distributed(&self) -> bool {
        self.group.is_some()
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// See [`broadcast_params`].
    pub fn broadcast_params<'p, I>(&self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = &'p mut Tensor>,
    {
        broadcast_params(self.group, params)
    }

    /// Wait for every rank; a no-op without a process group.
    pub fn barrier(&self) -> Result<()> {
        match self.group {
            Some(group) => group.barrier(),
            None => Ok(()),
        }
    }
}

/// Runs a user function inside a process group.
#[derive(Clone)]
pub struct Launcher {
    env: Arc<dyn EnvStore>,
    devices: Arc<dyn DeviceManager>,
    selector: BackendSelector,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            env: Arc::new(ProcessEnv),
            devices: Arc::new(CpuOnly),
            selector: BackendSelector::default(),
        }
    }
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launcher")
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl Launcher {
    pub fn with_env(mut self, env: Arc<dyn EnvStore>) -> Self {
        self.env = env;
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn DeviceManager>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.selector = self.selector.with_platform(platform);
        self
    }

    /// Register an accelerated transport, used when its probe succeeds.
    pub fn with_accelerated_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.selector = self.selector.with_accelerated(factory);
        self
    }

    pub fn with_fallback_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.selector = self.selector.with_fallback(factory);
        self
    }

    /// Run `f` as `rank` of a group of `world_size` processes.
    ///
    /// With no world size, a world size of one, or a single process per
    /// node, `f` runs directly and no process group is created. Otherwise
    /// the group is initialized from `MASTER_ADDR`/`MASTER_PORT`, `f` runs,
    /// all ranks meet at a barrier if `f` succeeded, and the group is
    /// destroyed whatever happened.
    ///
    /// An error from `f` is returned unchanged, even if teardown also fails.
    pub fn run<F, T, E>(
        &self,
        rank: usize,
        world_size: Option<usize>,
        f: F,
        args: &LaunchArgs,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(WorkerContext<'_>) -> std::result::Result<T, E>,
        E: From<DdpError>,
    {
        self.env.set_default(MASTER_ADDR, &args.master_address);
        self.env
            .set_default(MASTER_PORT, &args.master_port.to_string());

        let world_size = match world_size {
            Some(size) if size > 1 && args.num_process_per_node > 1 => size,
            _ => return self.run_single(rank, f, args),
        };

        let factory = self.selector.select();
        let gpu = args.local_rank.unwrap_or(rank);
        let device = select_device(self.devices.as_ref(), gpu)?;
        let rendezvous = Rendezvous::from_env(self.env.as_ref(), args)?;
        let group = ProcessGroup::init(factory.as_ref(), &rendezvous, rank, world_size)?;

        let ctx = WorkerContext {
            rank,
            world_size,
            gpu,
            device,
            args,
            group: Some(&group),
        };

        // A panic in `f` unwinds through `group`, whose Drop releases it
        let outcome = match f(ctx) {
            Ok(value) => match group.barrier() {
                Ok(()) => Ok(value),
                Err(e) => {
                    warn!(rank, error = %e, "Final barrier failed");
                    Err(E::from(e))
                }
            },
            Err(e) => {
                debug!(rank, "Worker function failed, skipping final barrier");
                Err(e)
            }
        };

        match (outcome, group.destroy()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(E::from(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!(rank, error = %teardown, "Failed to destroy process group after worker error");
                Err(e)
            }
        }
    }

    fn run_single<F, T, E>(&self, rank: usize, f: F, args: &LaunchArgs) -> std::result::Result<T, E>
    where
        F: FnOnce(WorkerContext<'_>) -> std::result::Result<T, E>,
        E: From<DdpError>,
    {
        let gpu = args.local_rank.unwrap_or(0);
        let device = select_device(self.devices.as_ref(), gpu)?;
        info!(rank, gpu, ?device, "Running without a process group");

        f(WorkerContext {
            rank,
            world_size: 1,
            gpu,
            device,
            args,
            group: None,
        })
    }
}

/// Run `f` with the default [`Launcher`]: process environment, host
/// devices, and the socket fallback transport.
pub fn init_processes<F, T, E>(
    rank: usize,
    world_size: Option<usize>,
    f: F,
    args: &LaunchArgs,
) -> std::result::Result<T, E>
where
    F: FnOnce(WorkerContext<'_>) -> std::result::Result<T, E>,
    E: From<DdpError>,
{
    Launcher::default().run(rank, world_size, f, args)
}

/// Overwrite every parameter with rank 0's copy.
///
/// Does nothing when `group` is `None`. Every rank must pass parameters of
/// matching lengths in the same order.
pub fn broadcast_params<'p, I>(group: Option<&ProcessGroup>, params: I) -> Result<()>
where
    I: IntoIterator<Item = &'p mut Tensor>,
{
    let Some(group) = group else {
        return Ok(());
    };

    let mut count = 0usize;
    for param in params {
        group.broadcast_tensor(param, 0)?;
        count += 1;
    }

    debug!(rank = group.rank(), count, "Broadcast parameters from rank 0");
    Ok(())
}

/// Destroy `group` if there is one.
pub fn cleanup(group: Option<ProcessGroup>) -> Result<()> {
    match group {
        Some(group) => group.destroy(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::env::MemoryEnv;
    use crate::transport::{ReduceOp, Transport};
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    enum TrainError {
        Diverged,
        Ddp(DdpError),
    }

    impl From<DdpError> for TrainError {
        fn from(e: DdpError) -> Self {
            TrainError::Ddp(e)
        }
    }

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        barriers: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct FakeTransport {
        rank: usize,
        world_size: usize,
        counters: Arc<Counters>,
        fail_barrier: bool,
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

        fn broadcast(&mut self, buffer: &mut [f32], _src: usize) -> Result<()> {
            buffer.iter_mut().for_each(|v| *v = 0.0);
            Ok(())
        }

        fn all_reduce(&mut self, _buffer: &mut [f32], _op: ReduceOp) -> Result<()> {
            Ok(())
        }

        fn barrier(&mut self) -> Result<()> {
            self.counters.barriers.fetch_add(1, Ordering::SeqCst);
            if self.fail_barrier {
                return Err(DdpError::Network("rank 0 vanished".into()));
            }
            Ok(())
        }

        fn shutdown(&mut self) -> Result<()> {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        counters: Arc<Counters>,
        refuse: bool,
        fail_barrier: bool,
    }

    impl TransportFactory for FakeFactory {
        fn backend(&self) -> Backend {
            Backend::Tcp
        }

        fn probe(&self) -> Result<bool> {
            Ok(true)
        }

        fn connect(
            &self,
            _: &Rendezvous,
            rank: usize,
            world_size: usize,
        ) -> Result<Box<dyn Transport>> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(DdpError::Rendezvous("master unreachable".into()));
            }
            Ok(Box::new(FakeTransport {
                rank,
                world_size,
                counters: Arc::clone(&self.counters),
                fail_barrier: self.fail_barrier,
            }))
        }
    }

    struct FakeDevices(usize);

    impl DeviceManager for FakeDevices {
        fn device_count(&self) -> usize {
            self.0
        }

        fn set_device(&self, _index: usize) -> Result<()> {
            Ok(())
        }
    }

    fn launcher(env: &Arc<MemoryEnv>, factory: FakeFactory) -> (Launcher, Arc<Counters>) {
        let counters = Arc::clone(&factory.counters);
        let launcher = Launcher::default()
            .with_env(Arc::clone(env) as Arc<dyn EnvStore>)
            .with_platform(Platform::Unix)
            .with_fallback_transport(Arc::new(factory));
        (launcher, counters)
    }

    fn distributed_args() -> LaunchArgs {
        LaunchArgs {
            num_process_per_node: 2,
            ..LaunchArgs::default()
        }
    }

    #[test]
    fn test_single_process_runs_directly() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, counters) = launcher(&env, FakeFactory::default());
        let args = LaunchArgs::default();

        let result: std::result::Result<u32, DdpError> = launcher.run(
            3,
            None,
            |ctx| {
                assert_eq!(ctx.rank, 3);
                assert_eq!(ctx.world_size, 1);
                assert_eq!(ctx.gpu, 0);
                assert_eq!(ctx.device, None);
                assert_eq!(ctx.args, &LaunchArgs::default());
                assert!(!ctx.is_distributed());
                ctx.barrier()?;
                Ok(42)
            },
            &args,
        );

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_environment_defaults_applied() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, _) = launcher(&env, FakeFactory::default());
        let args = LaunchArgs {
            master_port: 31337,
            ..LaunchArgs::default()
        };

        launcher
            .run(0, Some(1), |_| Ok::<_, DdpError>(()), &args)
            .unwrap();

        assert_eq!(env.get(MASTER_ADDR).as_deref(), Some("127.0.0.1"));
        assert_eq!(env.get(MASTER_PORT).as_deref(), Some("31337"));
    }

    #[test]
    fn test_existing_environment_kept() {
        let env = Arc::new(
            MemoryEnv::new()
                .with_var(MASTER_ADDR, "10.0.0.7")
                .with_var(MASTER_PORT, "40123"),
        );
        let (launcher, _) = launcher(&env, FakeFactory::default());

        launcher
            .run(0, None, |_| Ok::<_, DdpError>(()), &LaunchArgs::default())
            .unwrap();

        assert_eq!(env.get(MASTER_ADDR).as_deref(), Some("10.0.0.7"));
        assert_eq!(env.get(MASTER_PORT).as_deref(), Some("40123"));
    }

    #[test]
    fn test_one_process_per_node_skips_group() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, counters) = launcher(&env, FakeFactory::default());
        let args = LaunchArgs {
            local_rank: Some(1),
            ..LaunchArgs::default()
        };

        let gpu = launcher
            .run(2, Some(4), |ctx| Ok::<_, DdpError>(ctx.gpu), &args)
            .unwrap();

        assert_eq!(gpu, 1);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_group_destroyed_after_success() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, counters) = launcher(&env, FakeFactory::default());

        let (rank, world_size, gpu) = launcher
            .run(
                1,
                Some(2),
                |ctx| {
                    assert!(ctx.is_distributed());
                    assert_eq!(ctx.group().map(|g| g.rank()), Some(1));
                    Ok::<_, DdpError>((ctx.rank, ctx.world_size, ctx.gpu))
                },
                &distributed_args(),
            )
            .unwrap();

        assert_eq!((rank, world_size, gpu), (1, 2, 1));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.barriers.load(Ordering::SeqCst), 1);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_error_propagates_and_group_destroyed() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, counters) = launcher(&env, FakeFactory::default());

        let result: std::result::Result<(), TrainError> =
            launcher.run(0, Some(2), |_| Err(TrainError::Diverged), &distributed_args());

        assert!(matches!(result, Err(TrainError::Diverged)));
        assert_eq!(counters.barriers.load(Ordering::SeqCst), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_panic_still_destroys_group() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, counters) = launcher(&env, FakeFactory::default());
        let args = distributed_args();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            launcher.run(
                0,
                Some(2),
                |_| -> std::result::Result<(), DdpError> { panic!("loss is NaN") },
                &args,
            )
        }));

        assert!(result.is_err());
        assert_eq!(counters.barriers.load(Ordering::SeqCst), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_barrier_failure_still_destroys_group() {
        let env = Arc::new(MemoryEnv::new());
        let factory = FakeFactory {
            fail_barrier: true,
            ..FakeFactory::default()
        };
        let (launcher, counters) = launcher(&env, factory);

        let result = launcher.run(1, Some(2), |_| Ok::<_, DdpError>(()), &distributed_args());

        assert!(matches!(result, Err(DdpError::Network(_))));
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_init_failure_propagates() {
        let env = Arc::new(MemoryEnv::new());
        let factory = FakeFactory {
            refuse: true,
            ..FakeFactory::default()
        };
        let (launcher, _) = launcher(&env, factory);
        let mut called = false;

        let result: std::result::Result<(), TrainError> = launcher.run(
            1,
            Some(2),
            |_| {
                called = true;
                Ok(())
            },
            &distributed_args(),
        );

        assert!(matches!(
            result,
            Err(TrainError::Ddp(DdpError::Rendezvous(_)))
        ));
        assert!(!called);
    }

    #[test]
    fn test_local_rank_selects_device() {
        let env = Arc::new(MemoryEnv::new());
        let (launcher, _) = launcher(&env, FakeFactory::default());
        let launcher = launcher.with_devices(Arc::new(FakeDevices(4)));
        let args = LaunchArgs {
            local_rank: Some(2),
            ..distributed_args()
        };

        let device = launcher
            .run(1, Some(2), |ctx| Ok::<_, DdpError>(ctx.device), &args)
            .unwrap();

        assert_eq!(device, Some(2));
    }

    #[test]
    fn test_broadcast_params_without_group_is_noop() {
        let mut params = vec![Tensor::filled(vec![3], 7.0)];
        broadcast_params(None, params.iter_mut()).unwrap();
        assert_eq!(params[0].data, vec![7.0; 3]);
    }

    #[test]
    fn test_broadcast_params_through_group() {
        let counters = Arc::new(Counters::default());
        let group = ProcessGroup::from_transport(Box::new(FakeTransport {
            rank: 1,
            world_size: 2,
            counters: Arc::clone(&counters),
            fail_barrier: false,
        }));

        let mut params = vec![Tensor::filled(vec![2], 5.0), Tensor::filled(vec![1], 3.0)];
        broadcast_params(Some(&group), &mut params).unwrap();
        assert!(params.iter().all(|p| p.data.iter().all(|&v| v == 0.0)));

        cleanup(Some(group)).unwrap();
        cleanup(None).unwrap();
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }
}
