use crate::config::Rendezvous;
use crate::errors::Result;
use crate::transport::{TcpTransportFactory, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transport family backing a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// GPU-direct collectives
    Nccl,
    /// Socket-based fallback
    Tcp,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Nccl => f.write_str("nccl"),
            Backend::Tcp => f.write_str("tcp"),
        }
    }
}

/// Host platform, as far as backend selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Creates connected transports for one backend.
pub trait TransportFactory: Send + Sync {
    fn backend(&self) -> Backend;

    /// Whether the backend can be used on this host.
    fn probe(&self) -> Result<bool>;

    /// Join the group described by `rendezvous` as `rank`.
    fn connect(
        &self,
        rendezvous: &Rendezvous,
        rank: usize,
        world_size: usize,
    ) -> Result<Box<dyn Transport>>;
}

/// Chooses between an optional accelerated transport and the fallback.
#[derive(Clone)]
pub struct BackendSelector {
    platform: Platform,
    accelerated: Option<Arc<dyn TransportFactory>>,
    fallback: Arc<dyn TransportFactory>,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            accelerated: None,
            fallback: Arc::new(TcpTransportFactory),
        }
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSelector")
            .field("platform", &self.platform)
            .field("accelerated", &self.accelerated.as_ref().map(|a| a.backend()))
            .field("fallback", &self.fallback.backend())
            .finish()
    }
}

impl BackendSelector {
    pub fn new(platform: Platform, fallback: Arc<dyn TransportFactory>) -> Self {
        Self {
            platform,
            accelerated: None,
            fallback,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_accelerated(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.accelerated = Some(factory);
        self
    }

    pub fn with_fallback(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.fallback = factory;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Pick the factory to initialize the process group with.
    ///
    /// The accelerated transport is only considered off Windows, and only
    /// when its probe answers `true`. A probe that errors or panics counts
    /// as unavailable.
    pub fn select(&self) -> Arc<dyn TransportFactory> {
        let chosen = match (&self.accelerated, self.platform) {
            (Some(accelerated), Platform::Unix) if probe_available(accelerated.as_ref()) => {
                Arc::clone(accelerated)
            }
            (Some(accelerated), Platform::Windows) => {
                debug!(
                    backend = %accelerated.backend(),
                    "Accelerated backend not considered on Windows"
                );
                Arc::clone(&self.fallback)
            }
            _ => Arc::clone(&self.fallback),
        };

        info!(backend = %chosen.backend(), platform = ?self.platform, "Selected backend");
        chosen
    }
}

fn probe_available(factory: &dyn TransportFactory) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| factory.probe())) {
        Ok(Ok(available)) => {
            debug!(backend = %factory.backend(), available, "Backend probe finished");
            available
        }
        Ok(Err(e)) => {
            warn!(backend = %factory.backend(), error = %e, "Backend probe failed, falling back");
            false
        }
        Err(_) => {
            warn!(backend = %factory.backend(), "Backend probe panicked, falling back");
            false
        }
    }
}
