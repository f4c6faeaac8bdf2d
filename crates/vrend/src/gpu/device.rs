use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};

use crate::backend::BackendLimits;
use crate::error::{self, RenderError};

/// A headless adapter, device and queue.
pub struct GpuDevice {
    pub(super) device: wgpu::Device,
    pub(super) queue: wgpu::Queue,
    pub(super) features: wgpu::Features,
    limits: wgpu::Limits,
    info: wgpu::AdapterInfo,
}

impl GpuDevice {
    /// Opens the best adapter the host offers without a surface.
    pub fn headless() -> Result<Arc<Self>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .context("failed to find a suitable GPU adapter")?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        let features = adapter.features() & wgpu::Features::TEXTURE_COMPRESSION_BC;
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            ?features,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("vgpud device"),
            required_features: features,
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        Ok(Arc::new(Self {
            device,
            queue,
            features,
            limits,
            info,
        }))
    }

    pub fn adapter_name(&self) -> &str {
        &self.info.name
    }

    pub(super) fn backend_limits(&self) -> BackendLimits {
        let limits = &self.limits;
        BackendLimits {
            max_texture_2d: limits.max_texture_dimension_2d,
            max_texture_3d: limits.max_texture_dimension_3d,
            max_texture_cube: limits.max_texture_dimension_2d,
            max_texture_array_layers: limits.max_texture_array_layers,
            max_render_targets: limits.max_color_attachments,
            max_samples: 4,
            max_vertex_attribs: limits.max_vertex_attributes,
            max_uniform_blocks: limits.max_uniform_buffers_per_shader_stage,
            max_viewports: 1,
            max_compute_workgroup_invocations: limits.max_compute_invocations_per_workgroup,
            max_compute_workgroup_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_compute_grid_size: [limits.max_compute_workgroups_per_dimension; 3],
            max_compute_shared_memory: limits.max_compute_workgroup_storage_size,
            max_storage_buffers: limits.max_storage_buffers_per_shader_stage,
            max_storage_textures: limits.max_storage_textures_per_shader_stage,
            uniform_buffer_alignment: limits.min_uniform_buffer_offset_alignment,
            storage_buffer_alignment: limits.min_storage_buffer_offset_alignment,
        }
    }

    pub(super) fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
    }

    pub(super) fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Copies `len` bytes of `source` into a mappable buffer and waits for them.
    pub(super) fn read_buffer(
        &self,
        source: &wgpu::Buffer,
        offset: u64,
        len: u64,
    ) -> error::Result<Vec<u8>> {
        let staging = self.staging(len);
        let mut encoder = self.encoder("buffer readback");
        encoder.copy_buffer_to_buffer(source, offset, &staging, 0, len);
        self.submit(encoder);
        self.map(&staging, len)
    }

    pub(super) fn staging(&self, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Maps a staging buffer filled by already submitted work.
    pub(super) fn map(&self, staging: &wgpu::Buffer, len: u64) -> error::Result<Vec<u8>> {
        let slice = staging.slice(..len);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| RenderError::Driver(format!("device poll failed: {err}")))?;
        rx.recv()
            .map_err(|_| RenderError::Driver("readback callback dropped".into()))?
            .map_err(|err| RenderError::Driver(format!("readback mapping failed: {err}")))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Runs completion callbacks without blocking.
    pub(super) fn poll(&self) {
        if let Err(err) = self.device.poll(wgpu::PollType::Poll) {
            tracing::warn!(%err, "device poll failed");
        }
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .finish()
    }
}
