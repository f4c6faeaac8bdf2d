//! Headless wgpu backend.
//!
//! One [`GpuDevice`] is opened per process and shared by every connection;
//! each connection drives it through its own [`WgpuBackend`].

mod backend;
mod device;
mod format;

pub use backend::WgpuBackend;
pub use device::GpuDevice;
