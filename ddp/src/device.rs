use crate::errors::Result;
use tracing::debug;

/// Accelerator devices visible to this process.
pub trait DeviceManager: Send + Sync {
    /// Number of devices; zero means no accelerator is available.
    fn device_count(&self) -> usize;

    /// Make `index` the current device of this process.
    fn set_device(&self, index: usize) -> Result<()>;
}

/// Host without accelerators.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuOnly;

impl DeviceManager for CpuOnly {
    fn device_count(&self) -> usize {
        0
    }

    fn set_device(&self, _index: usize) -> Result<()> {
        Ok(())
    }
}

/// Select device `index` if it exists, returning it.
///
/// Returns `None` without touching the manager when there is no such device.
pub fn select_device(devices: &dyn DeviceManager, index: usize) -> Result<Option<usize>> {
    let count = devices.device_count();
    if index >= count {
        debug!(index, count, "No accelerator at requested index, staying on host");
        return Ok(None);
    }

    devices.set_device(index)?;
    debug!(index, "Selected accelerator");
    Ok(Some(index))
}
