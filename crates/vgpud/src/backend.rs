use std::sync::Arc;

use anyhow::{Context, Result};
use vgpuconfig::{BackendKind, ServerConfig};
use vgpuserver::BackendFactory;
use vrend::gpu::{GpuDevice, WgpuBackend};
use vrend::{Backend, NullBackend, RenderError};

/// Opens whatever the configured backend shares between connections and
/// returns a factory that builds one backend per client from it.
pub fn open(config: &ServerConfig) -> Result<Arc<dyn BackendFactory>> {
    match config.backend {
        BackendKind::Wgpu => {
            let gpu = GpuDevice::headless().context("failed to open a headless GPU device")?;
            tracing::info!(adapter = gpu.adapter_name(), "GPU device ready");
            Ok(Arc::new(move || -> Result<Box<dyn Backend>, RenderError> {
                Ok(Box::new(WgpuBackend::new(Arc::clone(&gpu))))
            }))
        }
        BackendKind::Null => {
            let fence_latency = config.null_backend.fence_latency;
            tracing::info!(fence_latency, "using the null backend");
            Ok(Arc::new(move || -> Result<Box<dyn Backend>, RenderError> {
                Ok(Box::new(NullBackend::new(fence_latency)))
            }))
        }
    }
}
