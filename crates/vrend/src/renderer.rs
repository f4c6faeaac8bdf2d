//! The renderer one connection drives: global resources, contexts and fences.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::backend::{Backend, BackendLimits, NativeContext, StorageDesc, TextureRegion};
use crate::caps::{self, CapsSet};
use crate::context::Context;
use crate::decode;
use crate::error::{ContextError, RenderError, Result};
use crate::fence::FenceList;
use crate::iov::{copy_iovec, IovecSet};
use crate::object::Query;
use crate::registry::{ReleaseQueue, Released, ResourceRef, ResourceTable};
use crate::resource::{
    plan_storage, validate, Resource, ResourceCreateArgs, StorageFlags, StoragePlan, TextureLimits,
};
use crate::transfer::{
    check_bounds, check_iov_bounds, pack_from_iov, packed_size, unpack_to_iov, TransferDirection,
    TransferInfo,
};

pub const DEFAULT_MAX_COMMAND_WORDS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererConfig {
    pub texture_limits: TextureLimits,
    /// Longest batch [`Renderer::submit`] accepts, in words.
    pub max_command_words: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            texture_limits: TextureLimits::default(),
            max_command_words: DEFAULT_MAX_COMMAND_WORDS,
        }
    }
}

/// A query whose result was requested before the backend had it.
#[derive(Debug)]
pub(crate) struct WaitingQuery {
    pub ctx_id: u32,
    pub query: Rc<Query>,
}

/// Resource, context and fence state for one client.
///
/// Context 0 is created with the renderer and lives as long as it does; it
/// owns transfers that address resources globally.
pub struct Renderer {
    pub(crate) backend: Box<dyn Backend>,
    config: RendererConfig,
    pub(crate) resources: ResourceTable,
    pub(crate) release: ReleaseQueue,
    pub(crate) contexts: BTreeMap<u32, Context>,
    current: Option<NativeContext>,
    fences: FenceList,
    pub(crate) waiting_queries: Vec<WaitingQuery>,
    pub(crate) scratch: Vec<u8>,
}

impl Renderer {
    pub fn new(mut backend: Box<dyn Backend>, config: RendererConfig) -> Result<Self> {
        let internal = Context::new(backend.as_mut(), 0, "internal")?;
        let mut contexts = BTreeMap::new();
        contexts.insert(0, internal);
        tracing::debug!(backend = backend.name(), "renderer initialised");
        Ok(Self {
            backend,
            config,
            resources: ResourceTable::default(),
            release: ReleaseQueue::default(),
            contexts,
            current: None,
            fences: FenceList::default(),
            waiting_queries: Vec::new(),
            scratch: Vec::new(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn backend_limits(&self) -> BackendLimits {
        self.backend.limits()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn caps(&self) -> CapsSet {
        caps::build(&self.backend.limits(), &self.config.texture_limits)
    }

    pub fn create_context(&mut self, ctx_id: u32, name: &str) -> Result<()> {
        if ctx_id == 0 {
            return Err(RenderError::invalid("context id 0 is reserved"));
        }
        if self.contexts.contains_key(&ctx_id) {
            return Err(RenderError::DuplicateHandle(ctx_id));
        }
        let ctx = Context::new(self.backend.as_mut(), ctx_id, name)?;
        self.contexts.insert(ctx_id, ctx);
        tracing::debug!(ctx_id, name, "context created");
        Ok(())
    }

    /// Tears a context down. Its fences are dropped without waiting and
    /// resources it attached survive while referenced elsewhere.
    pub fn destroy_context(&mut self, ctx_id: u32) {
        if ctx_id == 0 {
            return;
        }
        let Some(ctx) = self.contexts.remove(&ctx_id) else {
            return;
        };
        self.fences.abandon(self.backend.as_mut(), ctx_id);
        self.waiting_queries.retain(|waiting| waiting.ctx_id != ctx_id);
        self.current = None;
        ctx.destroy(self.backend.as_mut());
        self.flush_releases();
        tracing::debug!(ctx_id, "context destroyed");
    }

    pub fn has_context(&self, ctx_id: u32) -> bool {
        self.contexts.contains_key(&ctx_id)
    }

    pub fn context_error(&self, ctx_id: u32) -> Option<ContextError> {
        self.contexts.get(&ctx_id).and_then(|ctx| ctx.last_error)
    }

    /// Sub-context ids of a context, current one included.
    pub fn sub_contexts(&self, ctx_id: u32) -> Vec<u32> {
        self.contexts
            .get(&ctx_id)
            .map(Context::sub_ids)
            .unwrap_or_default()
    }

    pub fn resource_create(&mut self, args: &ResourceCreateArgs) -> Result<ResourceRef> {
        let (target, format) = validate(args, &self.config.texture_limits)?;
        if self.resources.contains(args.handle) {
            return Err(RenderError::DuplicateHandle(args.handle));
        }
        let plan = plan_storage(target, args.bind)?;
        let mut res = Resource::new(args, target, format, self.release.clone());
        match plan {
            StoragePlan::HostMemory => {
                let size = args.width as usize;
                let mut memory = Vec::new();
                memory.try_reserve_exact(size).map_err(|_| {
                    RenderError::OutOfMemory(format!("{size} bytes for resource {}", args.handle))
                })?;
                memory.resize(size, 0);
                res.host_memory = Some(memory);
                res.storage |= StorageFlags::HOST_SYSTEM_MEMORY;
            }
            StoragePlan::GuestOnly => {}
            StoragePlan::Buffer(kind) => {
                let desc = StorageDesc {
                    buffer: Some(kind),
                    ..res.storage_desc()
                };
                res.native = Some(self.backend.create_storage(&desc)?);
                res.storage |= StorageFlags::API_BUFFER;
            }
            StoragePlan::Texture => {
                res.native = Some(self.backend.create_storage(&res.storage_desc())?);
                res.storage |= StorageFlags::API_TEXTURE;
            }
        }
        let res = self.resources.insert(res)?;
        tracing::debug!(handle = args.handle, ?target, ?plan, "resource created");
        Ok(res)
    }

    /// Drops the global reference to a resource and detaches it everywhere.
    pub fn resource_unref(&mut self, handle: u32) -> bool {
        let Some(res) = self.resources.remove(handle) else {
            return false;
        };
        for ctx in self.contexts.values_mut() {
            ctx.attachments.detach(handle);
        }
        drop(res);
        self.flush_releases();
        tracing::debug!(handle, "resource unreferenced");
        true
    }

    pub fn resource(&self, handle: u32) -> Option<ResourceRef> {
        self.resources.lookup(handle)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn attach_resource(&mut self, ctx_id: u32, handle: u32) -> Result<()> {
        let res = self
            .resources
            .lookup(handle)
            .ok_or_else(|| RenderError::not_found("resource", handle))?;
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or_else(|| RenderError::not_found("context", ctx_id))?;
        ctx.attachments.attach(res);
        Ok(())
    }

    pub fn detach_resource(&mut self, ctx_id: u32, handle: u32) {
        if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
            ctx.attachments.detach(handle);
        }
    }

    /// Gives a resource its guest backing. A resource that already has one
    /// keeps it. Host-memory contents are copied into the new backing.
    pub fn attach_iov(&mut self, handle: u32, iov: IovecSet) -> Result<()> {
        let res = self
            .resources
            .lookup(handle)
            .ok_or_else(|| RenderError::not_found("resource", handle))?;
        let mut res = res.borrow_mut();
        if res.iov.is_some() {
            return Ok(());
        }
        if let Some(memory) = &res.host_memory {
            iov.write(0, memory);
        }
        res.iov = Some(iov);
        Ok(())
    }

    /// Takes the guest backing away, copying it back into host memory first.
    pub fn detach_iov(&mut self, handle: u32) -> Option<IovecSet> {
        let res = self.resources.lookup(handle)?;
        let mut res = res.borrow_mut();
        let iov = res.iov.take()?;
        if let Some(memory) = res.host_memory.as_mut() {
            iov.read(0, memory);
        }
        Some(iov)
    }

    /// Moves data between `iov` (or the resource's own backing when `None`)
    /// and the resource `info` names.
    pub fn transfer_iov(
        &mut self,
        info: &TransferInfo,
        direction: TransferDirection,
        iov: Option<&IovecSet>,
    ) -> Result<()> {
        let res = if info.context0 || info.ctx_id == 0 {
            self.resources.lookup(info.handle)
        } else {
            self.contexts
                .get(&info.ctx_id)
                .ok_or_else(|| RenderError::invalid(format!("no context {}", info.ctx_id)))?
                .attachments
                .lookup(info.handle)
        }
        .ok_or_else(|| RenderError::invalid(format!("no resource {}", info.handle)))?;

        let iov = match iov {
            Some(iov) => iov.clone(),
            None => res.borrow().iov.clone().ok_or_else(|| {
                RenderError::invalid(format!("resource {} has no backing", info.handle))
            })?,
        };
        self.transfer_resource(&res, info, direction, &iov)
    }

    pub(crate) fn transfer_resource(
        &mut self,
        res: &ResourceRef,
        info: &TransferInfo,
        direction: TransferDirection,
        iov: &IovecSet,
    ) -> Result<()> {
        let mut res = res.borrow_mut();
        check_bounds(&res, info)?;
        let strides = check_iov_bounds(&res, info, iov.size() as u64)?;
        let x = info.area.x as usize;
        let width = info.area.width as usize;
        let offset = info.offset as usize;

        if res.is_guest_only() || (res.has_host_memory() && res.iov.is_some()) {
            let backing = res.iov.clone().ok_or_else(|| {
                RenderError::invalid(format!("resource {} has no guest backing", res.handle))
            })?;
            return match direction {
                TransferDirection::ToHost => {
                    copy_iovec(iov, offset, &backing, x, width, &mut self.scratch)
                }
                TransferDirection::FromHost => {
                    copy_iovec(&backing, x, iov, offset, width, &mut self.scratch)
                }
            };
        }

        if let Some(memory) = res.host_memory.as_mut() {
            let range = memory.get_mut(x..x + width).ok_or_else(|| {
                RenderError::Fault(format!("{width} bytes at {x} outside host memory"))
            })?;
            return match direction {
                TransferDirection::ToHost => iov.read_exact(offset, range),
                TransferDirection::FromHost => iov.write_exact(offset, range),
            };
        }

        let native = res
            .native
            .ok_or_else(|| RenderError::Driver(format!("resource {} has no storage", res.handle)))?;

        if res.storage.contains(StorageFlags::API_BUFFER) {
            self.scratch.clear();
            self.scratch.resize(width, 0);
            return match direction {
                TransferDirection::ToHost => {
                    iov.read_exact(offset, &mut self.scratch)?;
                    self.backend.write_buffer(native, x as u64, &self.scratch)
                }
                TransferDirection::FromHost => {
                    self.backend.read_buffer(native, x as u64, &mut self.scratch)?;
                    iov.write_exact(offset, &self.scratch)
                }
            };
        }

        let region = texture_region(&res, info);
        match direction {
            TransferDirection::ToHost => {
                pack_from_iov(
                    iov,
                    &res.format,
                    info.offset,
                    strides,
                    &info.area,
                    res.y_0_top,
                    &mut self.scratch,
                )?;
                self.backend.write_texture(native, &region, &self.scratch)
            }
            TransferDirection::FromHost => {
                self.scratch.clear();
                self.scratch.resize(packed_size(&res.format, &info.area), 0);
                self.backend.read_texture(native, &region, &mut self.scratch)?;
                unpack_to_iov(
                    iov,
                    &res.format,
                    info.offset,
                    strides,
                    &info.area,
                    res.y_0_top,
                    &self.scratch,
                )
            }
        }
    }

    /// Decodes and applies a command batch on `ctx_id`.
    pub fn submit(&mut self, ctx_id: u32, words: &[u32]) -> Result<()> {
        if words.len() > self.config.max_command_words {
            return Err(RenderError::invalid(format!(
                "batch of {} words exceeds {}",
                words.len(),
                self.config.max_command_words
            )));
        }
        decode::decode_block(self, ctx_id, words)
    }

    pub fn create_fence(&mut self, ctx_id: u32, fence_id: u32) -> Result<()> {
        self.fences.create(self.backend.as_mut(), ctx_id, fence_id)
    }

    /// Retires signalled fences, re-checks waiting queries and hands released
    /// storage back to the backend. Returns the newest retired fence id.
    pub fn check_fences(&mut self) -> Option<u32> {
        let retired = self.fences.retire(self.backend.as_mut());
        self.check_queries();
        self.flush_releases();
        retired
    }

    pub fn pending_fences(&self) -> usize {
        self.fences.pending()
    }

    /// Makes `ctx_id`'s current sub-context the bound native context.
    ///
    /// Refused for a context other than 0 once it has latched an error.
    pub(crate) fn switch_context(&mut self, ctx_id: u32) -> Result<()> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or_else(|| RenderError::invalid(format!("no context {ctx_id}")))?;
        if ctx.in_error && ctx_id != 0 {
            return Err(RenderError::invalid(format!("context {ctx_id} is in error")));
        }
        let native = ctx.sub().native;
        if ctx.switch_pending || self.current != Some(native) {
            self.backend.make_current(native)?;
            ctx.switch_pending = false;
            self.current = Some(native);
        }
        Ok(())
    }

    pub(crate) fn flush_releases(&mut self) {
        for released in self.release.drain() {
            match released {
                Released::Storage(storage) => self.backend.release_storage(storage),
                Released::Query(query) => self.backend.release_query(query),
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.waiting_queries.clear();
        for (ctx_id, ctx) in std::mem::take(&mut self.contexts) {
            self.fences.abandon(self.backend.as_mut(), ctx_id);
            ctx.destroy(self.backend.as_mut());
        }
        self.resources.clear();
        self.flush_releases();
    }
}

/// Native region of a transfer box. Resources with row 0 at the top are
/// stored flipped, so the box is mirrored vertically within the level.
fn texture_region(res: &Resource, info: &TransferInfo) -> TextureRegion {
    let mut region = TextureRegion::from_box(info.level, &info.area);
    if res.y_0_top {
        let height = res.level_height(info.level);
        region.origin[1] = height.saturating_sub(region.origin[1] + region.extent[1]);
    }
    region
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{B8G8R8A8_UNORM, R8_UNORM};
    use crate::null::{NullBackend, RecordedCall};
    use crate::resource::{BindFlags, RESOURCE_Y_0_TOP};
    use crate::transfer::TransferBox;

    fn renderer() -> (Renderer, crate::null::CallLog) {
        let backend = NullBackend::new(0);
        let log = backend.log();
        let renderer = Renderer::new(Box::new(backend), RendererConfig::default()).unwrap();
        (renderer, log)
    }

    fn buffer(handle: u32, bind: BindFlags, width: u32) -> ResourceCreateArgs {
        ResourceCreateArgs {
            handle,
            target: 0,
            format: R8_UNORM,
            bind: bind.bits(),
            width,
            height: 1,
            depth: 1,
            array_size: 1,
            ..Default::default()
        }
    }

    fn linear(handle: u32, x: u32, width: u32, offset: u64) -> TransferInfo {
        TransferInfo {
            handle,
            area: TransferBox::new([x, 0, 0], [width, 1, 1]),
            offset,
            context0: true,
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_handles_rejected_until_destroyed() {
        let (mut r, _) = renderer();
        r.resource_create(&buffer(5, BindFlags::VERTEX_BUFFER, 64)).unwrap();
        assert_eq!(
            r.resource_create(&buffer(5, BindFlags::VERTEX_BUFFER, 64)).unwrap_err(),
            RenderError::DuplicateHandle(5)
        );
        assert!(r.resource_unref(5));
        r.resource_create(&buffer(5, BindFlags::VERTEX_BUFFER, 64)).unwrap();
    }

    #[test]
    fn storage_released_when_last_reference_drops() {
        let (mut r, log) = renderer();
        r.create_context(1, "c").unwrap();
        r.resource_create(&buffer(5, BindFlags::VERTEX_BUFFER, 64)).unwrap();
        r.attach_resource(1, 5).unwrap();
        let held = r.resource(5).unwrap();
        r.resource_unref(5);
        assert!(!log.snapshot().iter().any(|c| matches!(c, RecordedCall::ReleaseStorage(_))));
        drop(held);
        r.check_fences();
        assert!(log.snapshot().iter().any(|c| matches!(c, RecordedCall::ReleaseStorage(_))));
    }

    #[test]
    fn staging_round_trip_through_guest_memory() {
        let (mut r, _) = renderer();
        r.resource_create(&buffer(7, BindFlags::STAGING, 32)).unwrap();
        r.attach_iov(7, IovecSet::single(vec![0u8; 32])).unwrap();

        let src = IovecSet::single((0u8..16).collect::<Vec<_>>());
        r.transfer_iov(&linear(7, 8, 16, 0), TransferDirection::ToHost, Some(&src))
            .unwrap();
        let dst = IovecSet::single(vec![0u8; 16]);
        r.transfer_iov(&linear(7, 8, 16, 0), TransferDirection::FromHost, Some(&dst))
            .unwrap();
        let mut out = [0u8; 16];
        dst.read(0, &mut out);
        assert_eq!(out.to_vec(), (0u8..16).collect::<Vec<_>>());
    }

    #[test]
    fn host_memory_follows_attached_backing() {
        let (mut r, _) = renderer();
        r.resource_create(&buffer(9, BindFlags::CUSTOM, 8)).unwrap();
        let data = IovecSet::single(vec![3u8; 8]);
        r.transfer_iov(&linear(9, 0, 8, 0), TransferDirection::ToHost, Some(&data))
            .unwrap();

        // attaching copies host memory out into the new backing
        let backing = IovecSet::single(vec![0u8; 8]);
        r.attach_iov(9, backing.clone()).unwrap();
        let mut out = [0u8; 8];
        backing.read(0, &mut out);
        assert_eq!(out, [3; 8]);

        backing.write(0, &[9; 8]);
        assert!(r.detach_iov(9).is_some());
        let res = r.resource(9).unwrap();
        assert_eq!(res.borrow().host_memory.as_deref(), Some(&[9u8; 8][..]));
    }

    #[test]
    fn transfer_without_any_backing_is_invalid() {
        let (mut r, _) = renderer();
        r.resource_create(&buffer(9, BindFlags::CUSTOM, 8)).unwrap();
        let err = r
            .transfer_iov(&linear(9, 0, 8, 0), TransferDirection::FromHost, None)
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidArgument(_)));
    }

    #[test]
    fn api_buffer_transfers_reach_the_backend() {
        let (mut r, log) = renderer();
        r.resource_create(&buffer(4, BindFlags::CONSTANT_BUFFER, 64)).unwrap();
        let src = IovecSet::single(vec![5u8; 32]);
        r.transfer_iov(&linear(4, 16, 16, 8), TransferDirection::ToHost, Some(&src))
            .unwrap();
        assert!(log
            .snapshot()
            .iter()
            .any(|c| matches!(c, RecordedCall::WriteBuffer { offset: 16, len: 16, .. })));

        let dst = IovecSet::single(vec![0u8; 16]);
        r.transfer_iov(&linear(4, 16, 16, 0), TransferDirection::FromHost, Some(&dst))
            .unwrap();
        let mut out = [0u8; 16];
        dst.read(0, &mut out);
        assert_eq!(out, [5; 16]);
    }

    #[test]
    fn flipped_texture_round_trip() {
        let (mut r, log) = renderer();
        let args = ResourceCreateArgs {
            handle: 3,
            target: 2,
            format: B8G8R8A8_UNORM,
            bind: BindFlags::SAMPLER_VIEW.bits(),
            width: 4,
            height: 4,
            depth: 1,
            array_size: 1,
            flags: RESOURCE_Y_0_TOP,
            ..Default::default()
        };
        r.resource_create(&args).unwrap();
        let info = TransferInfo {
            handle: 3,
            area: TransferBox::new([0, 0, 0], [4, 1, 1]),
            context0: true,
            ..Default::default()
        };
        let row: Vec<u8> = (0u8..16).collect();
        r.transfer_iov(&info, TransferDirection::ToHost, Some(&IovecSet::single(row.clone())))
            .unwrap();
        // guest row 0 lands in the bottom row of the native texture
        assert!(log.snapshot().iter().any(|c| matches!(
            c,
            RecordedCall::WriteTexture { region, .. } if region.origin[1] == 3
        )));

        let back = IovecSet::single(vec![0u8; 16]);
        r.transfer_iov(&info, TransferDirection::FromHost, Some(&back)).unwrap();
        let mut out = [0u8; 16];
        back.read(0, &mut out);
        assert_eq!(out.to_vec(), row);
    }

    #[test]
    fn out_of_bounds_box_rejected() {
        let (mut r, _) = renderer();
        r.resource_create(&buffer(7, BindFlags::STAGING, 32)).unwrap();
        r.attach_iov(7, IovecSet::single(vec![0u8; 32])).unwrap();
        let src = IovecSet::single(vec![0u8; 64]);
        assert!(r
            .transfer_iov(&linear(7, 24, 16, 0), TransferDirection::ToHost, Some(&src))
            .is_err());
    }

    #[test]
    fn context_lifecycle() {
        let (mut r, _) = renderer();
        assert!(r.create_context(0, "zero").is_err());
        r.create_context(2, "two").unwrap();
        assert_eq!(
            r.create_context(2, "again").unwrap_err(),
            RenderError::DuplicateHandle(2)
        );
        r.create_fence(2, 1).unwrap();
        r.destroy_context(2);
        assert!(!r.has_context(2));
        assert_eq!(r.pending_fences(), 0);
        r.destroy_context(0);
        assert!(r.has_context(0));
    }

    #[test]
    fn oversized_batches_rejected() {
        let backend = NullBackend::new(0);
        let config = RendererConfig {
            max_command_words: 4,
            ..RendererConfig::default()
        };
        let mut r = Renderer::new(Box::new(backend), config).unwrap();
        r.create_context(1, "c").unwrap();
        assert!(r.submit(1, &[0; 5]).is_err());
        assert!(r.submit(1, &[0; 4]).is_ok());
    }
}
