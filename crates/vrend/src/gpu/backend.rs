use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::device::GpuDevice;
use super::format::{aspect, texture_format};
use crate::backend::{
    Backend, BackendLimits, FramebufferTargets, NativeCall, NativeContext, NativeFence,
    NativeQuery, NativeStorage, QueryKind, StorageDesc, SurfaceTarget, TextureRegion,
};
use crate::error::{RenderError, Result};
use crate::null::{DrawCounter, HostTexture};
use crate::object::BlitInfo;
use crate::resource::Target;
use crate::transfer::TransferBox;

const CLEAR_DEPTH: u32 = 1 << 0;
const CLEAR_STENCIL: u32 = 1 << 1;
const CLEAR_COLOR0: u32 = 1 << 2;

enum GpuStorage {
    Buffer {
        buffer: wgpu::Buffer,
        size: u64,
    },
    Texture {
        texture: wgpu::Texture,
        desc: StorageDesc,
        format: wgpu::TextureFormat,
    },
    /// Formats without a native equivalent.
    Host(HostTexture),
}

fn align4(value: u64) -> u64 {
    value.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

fn driver(msg: impl Into<String>) -> RenderError {
    RenderError::Driver(msg.into())
}

fn dimension(target: Target) -> wgpu::TextureDimension {
    match target {
        Target::Texture3d => wgpu::TextureDimension::D3,
        _ => wgpu::TextureDimension::D2,
    }
}

fn extent(desc: &StorageDesc) -> wgpu::Extent3d {
    let layers = match desc.target {
        Target::Texture3d => desc.depth,
        _ => desc.array_size,
    };
    wgpu::Extent3d {
        width: desc.width.max(1),
        height: desc.height.max(1),
        depth_or_array_layers: layers.max(1),
    }
}

/// Copy footprint of `region`: block-rounded extent, row pitch and row count.
fn footprint(desc: &StorageDesc, region: &TextureRegion) -> (wgpu::Extent3d, u32, u32) {
    let fmt = &desc.format;
    let [w, h, d] = region.extent;
    let size = wgpu::Extent3d {
        width: fmt.blocks_x(w) * fmt.block_width,
        height: fmt.blocks_y(h) * fmt.block_height,
        depth_or_array_layers: d.max(1),
    };
    (size, fmt.blocks_x(w) * fmt.block_size, fmt.blocks_y(h))
}

fn origin(region: &TextureRegion) -> wgpu::Origin3d {
    let [x, y, z] = region.origin;
    wgpu::Origin3d { x, y, z }
}

/// Renders into a device shared with other connections.
pub struct WgpuBackend {
    gpu: Arc<GpuDevice>,
    next_id: u64,
    storage: HashMap<NativeStorage, GpuStorage>,
    fences: HashMap<NativeFence, Arc<AtomicBool>>,
    queries: DrawCounter,
}

impl WgpuBackend {
    pub fn new(gpu: Arc<GpuDevice>) -> Self {
        Self {
            gpu,
            next_id: 1,
            storage: HashMap::new(),
            fences: HashMap::new(),
            queries: DrawCounter::default(),
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn get(&self, storage: NativeStorage) -> Result<&GpuStorage> {
        self.storage
            .get(&storage)
            .ok_or_else(|| driver(format!("unknown storage {}", storage.0)))
    }

    fn buffer(&self, storage: NativeStorage) -> Result<(&wgpu::Buffer, u64)> {
        match self.get(storage)? {
            GpuStorage::Buffer { buffer, size } => Ok((buffer, *size)),
            _ => Err(driver("buffer access on a texture")),
        }
    }

    fn create_buffer(&self, desc: &StorageDesc) -> GpuStorage {
        let size = align4(u64::from(desc.width).max(4));
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("guest buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::INDEX
                | wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });
        GpuStorage::Buffer { buffer, size }
    }

    fn create_texture(&self, desc: &StorageDesc) -> GpuStorage {
        let Some(format) = texture_format(desc.format.id, self.gpu.features) else {
            tracing::debug!(
                handle = desc.handle,
                format = desc.format.id,
                "no native format, keeping texture in host memory"
            );
            return GpuStorage::Host(HostTexture::new(desc));
        };
        let mut usage = wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::TEXTURE_BINDING;
        if !format.is_compressed() {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("guest texture"),
            size: extent(desc),
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: dimension(desc.target),
            format,
            usage,
            view_formats: &[],
        });
        GpuStorage::Texture {
            texture,
            desc: *desc,
            format,
        }
    }

    fn clear_view(
        &self,
        target: &SurfaceTarget,
        layer: u32,
    ) -> Result<Option<wgpu::TextureView>> {
        let GpuStorage::Texture { texture, desc, .. } = self.get(target.storage)? else {
            return Ok(None);
        };
        let three_d = desc.target == Target::Texture3d;
        Ok(Some(texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("clear target"),
            dimension: Some(if three_d {
                wgpu::TextureViewDimension::D3
            } else {
                wgpu::TextureViewDimension::D2
            }),
            base_mip_level: target.level,
            mip_level_count: Some(1),
            base_array_layer: if three_d { 0 } else { layer },
            array_layer_count: Some(1),
            ..Default::default()
        })))
    }

    fn clear(
        &mut self,
        targets: &FramebufferTargets,
        buffers: u32,
        color: [f32; 4],
        depth: f64,
    ) -> Result<()> {
        let mut encoder = self.gpu.encoder("clear");
        let load = wgpu::LoadOp::Clear(wgpu::Color {
            r: f64::from(color[0]),
            g: f64::from(color[1]),
            b: f64::from(color[2]),
            a: f64::from(color[3]),
        });
        for (index, target) in targets.colors.iter().enumerate() {
            let Some(target) = target else { continue };
            if buffers & (CLEAR_COLOR0 << index) == 0 {
                continue;
            }
            let three_d = matches!(
                self.get(target.storage)?,
                GpuStorage::Texture { desc, .. } if desc.target == Target::Texture3d
            );
            for layer in target.first_layer..=target.last_layer {
                let Some(view) = self.clear_view(target, layer)? else {
                    tracing::debug!(index, "clear of a host-memory surface skipped");
                    break;
                };
                encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("clear color"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &view,
                        depth_slice: three_d.then_some(layer),
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    occlusion_query_set: None,
                    timestamp_writes: None,
                });
            }
        }

        if buffers & (CLEAR_DEPTH | CLEAR_STENCIL) != 0 {
            if let Some(target) = &targets.depth {
                if let Some(view) = self.clear_view(target, target.first_layer)? {
                    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("clear depth"),
                        color_attachments: &[],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &view,
                            depth_ops: (buffers & CLEAR_DEPTH != 0).then_some(wgpu::Operations {
                                load: wgpu::LoadOp::Clear(depth as f32),
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }),
                        occlusion_query_set: None,
                        timestamp_writes: None,
                    });
                }
            }
        }
        self.gpu.submit(encoder);
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: NativeStorage,
        src_box: &TransferBox,
        dst: NativeStorage,
        dst_x: u32,
    ) -> Result<()> {
        let (offset, len) = (src_box.x as u64, src_box.width as u64);
        let aligned = offset % 4 == 0 && u64::from(dst_x) % 4 == 0 && len % 4 == 0;
        if aligned {
            let (src_buf, _) = self.buffer(src)?;
            let (dst_buf, _) = self.buffer(dst)?;
            let mut encoder = self.gpu.encoder("buffer copy");
            encoder.copy_buffer_to_buffer(src_buf, offset, dst_buf, u64::from(dst_x), len);
            self.gpu.submit(encoder);
            return Ok(());
        }
        let mut data = vec![0; len as usize];
        self.read_buffer(src, offset, &mut data)?;
        self.write_buffer(dst, u64::from(dst_x), &data)
    }

    /// Texture copy that goes through host memory when either side is not a
    /// native texture.
    fn copy_texture(
        &mut self,
        src: NativeStorage,
        src_region: TextureRegion,
        dst: NativeStorage,
        dst_region: TextureRegion,
    ) -> Result<()> {
        if let (
            GpuStorage::Texture { texture: s, format: sf, .. },
            GpuStorage::Texture { texture: d, format: df, .. },
        ) = (self.get(src)?, self.get(dst)?)
        {
            if sf.remove_srgb_suffix() == df.remove_srgb_suffix() {
                let [w, h, depth] = src_region.extent;
                let mut encoder = self.gpu.encoder("texture copy");
                encoder.copy_texture_to_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: s,
                        mip_level: src_region.level,
                        origin: origin(&src_region),
                        aspect: aspect(*sf),
                    },
                    wgpu::TexelCopyTextureInfo {
                        texture: d,
                        mip_level: dst_region.level,
                        origin: origin(&dst_region),
                        aspect: aspect(*df),
                    },
                    wgpu::Extent3d {
                        width: w,
                        height: h,
                        depth_or_array_layers: depth.max(1),
                    },
                );
                self.gpu.submit(encoder);
                return Ok(());
            }
        }
        let len = self.region_len(src, &src_region)?;
        let mut data = vec![0; len];
        self.read_texture(src, &src_region, &mut data)?;
        self.write_texture(dst, &dst_region, &data)
    }

    fn region_len(&self, storage: NativeStorage, region: &TextureRegion) -> Result<usize> {
        let [w, h, d] = region.extent;
        let fmt = match self.get(storage)? {
            GpuStorage::Texture { desc, .. } => desc.format,
            GpuStorage::Host(host) => host.format(),
            GpuStorage::Buffer { .. } => return Err(driver("texture copy from a buffer")),
        };
        Ok(fmt.stride(w) as usize * fmt.blocks_y(h) as usize * d.max(1) as usize)
    }

    fn blit(&mut self, src: NativeStorage, dst: NativeStorage, info: &BlitInfo) -> Result<()> {
        let (s, d) = (&info.src.area, &info.dst.area);
        if s.width != d.width || s.height != d.height || s.depth != d.depth || info.scissor_enable {
            tracing::debug!(
                src = info.src.handle,
                dst = info.dst.handle,
                "scaled or scissored blit not supported by this backend"
            );
            return Ok(());
        }
        self.copy_texture(
            src,
            TextureRegion::from_box(info.src.level, s),
            dst,
            TextureRegion::from_box(info.dst.level, d),
        )
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn limits(&self) -> BackendLimits {
        self.gpu.backend_limits()
    }

    fn create_context(&mut self, ctx_id: u32, sub_ctx_id: u32) -> Result<NativeContext> {
        tracing::trace!(ctx_id, sub_ctx_id, "native context");
        Ok(NativeContext(self.next()))
    }

    fn destroy_context(&mut self, _context: NativeContext) {}

    fn make_current(&mut self, _context: NativeContext) -> Result<()> {
        Ok(())
    }

    fn create_storage(&mut self, desc: &StorageDesc) -> Result<NativeStorage> {
        let storage = if desc.is_buffer() {
            self.create_buffer(desc)
        } else {
            self.create_texture(desc)
        };
        let id = NativeStorage(self.next());
        self.storage.insert(id, storage);
        Ok(id)
    }

    fn release_storage(&mut self, storage: NativeStorage) {
        match self.storage.remove(&storage) {
            Some(GpuStorage::Buffer { buffer, .. }) => buffer.destroy(),
            Some(GpuStorage::Texture { texture, .. }) => texture.destroy(),
            Some(GpuStorage::Host(_)) | None => {}
        }
    }

    fn write_buffer(&mut self, storage: NativeStorage, offset: u64, data: &[u8]) -> Result<()> {
        let (buffer, size) = self.buffer(storage)?;
        let end = offset + data.len() as u64;
        if end > size {
            return Err(driver("buffer write out of range"));
        }
        if offset % 4 == 0 && data.len() % 4 == 0 {
            self.gpu.queue.write_buffer(buffer, offset, data);
            return Ok(());
        }
        // Copies must be four byte aligned, so patch the surrounding words.
        let start = offset & !3;
        let mut words = self.gpu.read_buffer(buffer, start, align4(end) - start)?;
        let at = (offset - start) as usize;
        words[at..at + data.len()].copy_from_slice(data);
        self.gpu.queue.write_buffer(buffer, start, &words);
        Ok(())
    }

    fn read_buffer(&mut self, storage: NativeStorage, offset: u64, out: &mut [u8]) -> Result<()> {
        let (buffer, size) = self.buffer(storage)?;
        let end = offset + out.len() as u64;
        if end > size {
            return Err(driver("buffer read out of range"));
        }
        let start = offset & !3;
        let words = self.gpu.read_buffer(buffer, start, align4(end) - start)?;
        let at = (offset - start) as usize;
        out.copy_from_slice(&words[at..at + out.len()]);
        Ok(())
    }

    fn write_texture(
        &mut self,
        storage: NativeStorage,
        region: &TextureRegion,
        data: &[u8],
    ) -> Result<()> {
        if let Some(GpuStorage::Host(host)) = self.storage.get_mut(&storage) {
            return host.write(region, data);
        }
        let GpuStorage::Texture {
            texture,
            desc,
            format,
        } = self.get(storage)?
        else {
            return Err(driver("texture write to a buffer"));
        };
        let (size, row, rows) = footprint(desc, region);
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: region.level,
                origin: origin(region),
                aspect: aspect(*format),
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(rows),
            },
            size,
        );
        Ok(())
    }

    fn read_texture(
        &mut self,
        storage: NativeStorage,
        region: &TextureRegion,
        out: &mut [u8],
    ) -> Result<()> {
        if let Some(GpuStorage::Host(host)) = self.storage.get_mut(&storage) {
            return host.read(region, out);
        }
        let GpuStorage::Texture {
            texture,
            desc,
            format,
        } = self.get(storage)?
        else {
            return Err(driver("texture read from a buffer"));
        };
        let (size, row, rows) = footprint(desc, region);
        let padded = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let slices = size.depth_or_array_layers;
        let total = u64::from(padded) * u64::from(rows) * u64::from(slices);
        let staging = self.gpu.staging(total);
        let mut encoder = self.gpu.encoder("texture readback");
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: region.level,
                origin: origin(region),
                aspect: aspect(*format),
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(rows),
                },
            },
            size,
        );
        self.gpu.submit(encoder);
        let data = self.gpu.map(&staging, total)?;

        let (row, padded) = (row as usize, padded as usize);
        let needed = row * rows as usize * slices as usize;
        if out.len() < needed {
            return Err(driver("readback buffer too short"));
        }
        for (dst, src) in out[..needed].chunks_mut(row).zip(data.chunks(padded)) {
            dst.copy_from_slice(&src[..row]);
        }
        Ok(())
    }

    fn create_fence(&mut self) -> Result<NativeFence> {
        let signaled = Arc::new(AtomicBool::new(false));
        self.gpu.queue.submit(std::iter::empty());
        let flag = Arc::clone(&signaled);
        self.gpu
            .queue
            .on_submitted_work_done(move || flag.store(true, Ordering::Release));
        let fence = NativeFence(self.next());
        self.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn fence_signaled(&mut self, fence: NativeFence) -> bool {
        let Some(signaled) = self.fences.get(&fence) else {
            return true;
        };
        if !signaled.load(Ordering::Acquire) {
            self.gpu.poll();
        }
        signaled.load(Ordering::Acquire)
    }

    fn release_fence(&mut self, fence: NativeFence) {
        self.fences.remove(&fence);
    }

    fn create_query(&mut self, kind: QueryKind) -> Result<NativeQuery> {
        let query = NativeQuery(self.next());
        self.queries.create(query, kind);
        Ok(query)
    }

    fn query_result(&mut self, query: NativeQuery, _wait: bool) -> Result<Option<u64>> {
        self.queries.result(query)
    }

    fn release_query(&mut self, query: NativeQuery) {
        self.queries.release(query);
    }

    fn execute(&mut self, call: NativeCall) -> Result<()> {
        self.queries.observe(&call);
        match call {
            NativeCall::Clear {
                targets,
                buffers,
                color,
                depth,
                ..
            } => self.clear(&targets, buffers, color, depth),
            NativeCall::CopyRegion {
                src,
                src_box,
                dst,
                dst_origin,
                buffer: true,
                ..
            } => self.copy_buffer(src, &src_box, dst, dst_origin[0]),
            NativeCall::CopyRegion {
                src,
                src_level,
                src_box,
                dst,
                dst_level,
                dst_origin,
                buffer: false,
            } => {
                let src_region = TextureRegion::from_box(src_level, &src_box);
                let dst_region = TextureRegion {
                    level: dst_level,
                    origin: dst_origin,
                    extent: src_region.extent,
                };
                self.copy_texture(src, src_region, dst, dst_region)
            }
            NativeCall::Blit { src, dst, info } => self.blit(src, dst, &info),
            NativeCall::Draw { info, .. } => {
                tracing::trace!(mode = info.mode, count = info.count, "draw accepted");
                Ok(())
            }
            NativeCall::LaunchGrid { info, .. } => {
                tracing::trace!(grid = ?info.grid, "dispatch accepted");
                Ok(())
            }
            other => {
                tracing::trace!(call = ?other, "native call");
                Ok(())
            }
        }
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        for (_, storage) in self.storage.drain() {
            match storage {
                GpuStorage::Buffer { buffer, .. } => buffer.destroy(),
                GpuStorage::Texture { texture, .. } => texture.destroy(),
                GpuStorage::Host(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{describe, B8G8R8A8_UNORM, DXT1_RGB};

    fn desc(format: u32, width: u32, height: u32) -> StorageDesc {
        StorageDesc {
            handle: 1,
            target: Target::Texture2d,
            format: describe(format).unwrap(),
            width,
            height,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            samples: 1,
            buffer: None,
        }
    }

    #[test]
    fn footprint_rounds_to_blocks() {
        let region = TextureRegion {
            level: 0,
            origin: [0, 0, 0],
            extent: [5, 3, 1],
        };
        let (size, row, rows) = footprint(&desc(DXT1_RGB, 8, 8), &region);
        assert_eq!((size.width, size.height), (8, 4));
        assert_eq!((row, rows), (16, 1));

        let (size, row, rows) = footprint(&desc(B8G8R8A8_UNORM, 8, 8), &region);
        assert_eq!((size.width, size.height), (5, 3));
        assert_eq!((row, rows), (20, 3));
    }

    #[test]
    fn array_targets_use_layers() {
        let mut d = desc(B8G8R8A8_UNORM, 4, 4);
        d.target = Target::Texture2dArray;
        d.array_size = 3;
        assert_eq!(extent(&d).depth_or_array_layers, 3);
        d.target = Target::Texture3d;
        d.depth = 7;
        assert_eq!(extent(&d).depth_or_array_layers, 7);
        assert_eq!(align4(5), 8);
    }
}
