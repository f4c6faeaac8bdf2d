//! A backend without a GPU.
//!
//! Storage lives in host vectors, every rendering call is appended to a shared
//! [`CallLog`], and fences signal after a fixed number of polls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{
    Backend, BackendLimits, NativeCall, NativeContext, NativeFence, NativeQuery, NativeStorage,
    QueryKind, StorageDesc, TextureRegion,
};
use crate::error::{RenderError, Result};
use crate::format::FormatDesc;
use crate::resource::Target;

/// A call the null backend received.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    CreateContext { ctx_id: u32, sub_ctx_id: u32 },
    DestroyContext(NativeContext),
    MakeCurrent(NativeContext),
    CreateStorage { handle: u32, buffer: bool },
    ReleaseStorage(NativeStorage),
    WriteBuffer { storage: NativeStorage, offset: u64, len: usize },
    ReadBuffer { storage: NativeStorage, offset: u64, len: usize },
    WriteTexture { storage: NativeStorage, region: TextureRegion },
    ReadTexture { storage: NativeStorage, region: TextureRegion },
    CreateQuery(QueryKind),
    ReleaseQuery(NativeQuery),
    Execute(NativeCall),
}

/// Shared view of the calls made so far. Fence polling is not recorded.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallLog {
    fn push(&self, call: RecordedCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Calls recorded after the first `from`.
    pub fn since(&self, from: usize) -> Vec<RecordedCall> {
        self.snapshot().into_iter().skip(from).collect()
    }

    pub fn executed(&self) -> Vec<NativeCall> {
        self.snapshot()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Execute(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug)]
enum Storage {
    Buffer(Vec<u8>),
    Texture(HostTexture),
}

fn level_extent(value: u32, level: u32) -> u32 {
    value.checked_shr(level).unwrap_or(0).max(1)
}

fn level_geometry(desc: &StorageDesc, level: u32) -> (usize, usize, usize) {
    let row = desc.format.blocks_x(level_extent(desc.width, level)) as usize
        * desc.format.block_size as usize;
    let rows = desc.format.blocks_y(level_extent(desc.height, level)) as usize;
    let slices = if desc.target == Target::Texture3d {
        level_extent(desc.depth, level) as usize
    } else {
        desc.array_size.max(1) as usize
    };
    (row, rows, slices)
}

#[derive(Debug)]
struct PendingQuery {
    kind: QueryKind,
    begin_draws: u64,
    result: Option<u64>,
}

/// Queries answered from the number of draws seen between begin and end.
#[derive(Debug, Default)]
pub(crate) struct DrawCounter {
    draws: u64,
    queries: HashMap<NativeQuery, PendingQuery>,
}

impl DrawCounter {
    pub(crate) fn create(&mut self, query: NativeQuery, kind: QueryKind) {
        self.queries.insert(
            query,
            PendingQuery {
                kind,
                begin_draws: 0,
                result: None,
            },
        );
    }

    pub(crate) fn result(&self, query: NativeQuery) -> Result<Option<u64>> {
        let pending = self
            .queries
            .get(&query)
            .ok_or_else(|| RenderError::Driver(format!("unknown query {}", query.0)))?;
        Ok(pending.result)
    }

    pub(crate) fn release(&mut self, query: NativeQuery) {
        self.queries.remove(&query);
    }

    pub(crate) fn observe(&mut self, call: &NativeCall) {
        match call {
            NativeCall::Draw { .. } => self.draws += 1,
            NativeCall::BeginQuery(query) => {
                if let Some(pending) = self.queries.get_mut(query) {
                    pending.begin_draws = self.draws;
                    pending.result = None;
                }
            }
            NativeCall::EndQuery(query) => {
                if let Some(pending) = self.queries.get_mut(query) {
                    let draws = self.draws - pending.begin_draws;
                    pending.result = Some(match pending.kind {
                        QueryKind::Predicate | QueryKind::PredicateConservative => {
                            u64::from(draws > 0)
                        }
                        _ => draws,
                    });
                }
            }
            _ => {}
        }
    }
}

pub struct NullBackend {
    log: CallLog,
    fence_latency: u32,
    next_id: u64,
    storage: HashMap<NativeStorage, Storage>,
    fences: HashMap<NativeFence, u32>,
    queries: DrawCounter,
    limits: BackendLimits,
}

impl NullBackend {
    /// `fence_latency` is the number of polls a fence stays unsignalled.
    pub fn new(fence_latency: u32) -> Self {
        Self {
            log: CallLog::default(),
            fence_latency,
            next_id: 1,
            storage: HashMap::new(),
            fences: HashMap::new(),
            queries: DrawCounter::default(),
            limits: BackendLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BackendLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn storage_mut(&mut self, storage: NativeStorage) -> Result<&mut Storage> {
        self.storage
            .get_mut(&storage)
            .ok_or_else(|| RenderError::Driver(format!("unknown storage {}", storage.0)))
    }

    fn texture_mut(&mut self, storage: NativeStorage) -> Result<&mut HostTexture> {
        match self.storage_mut(storage)? {
            Storage::Texture(texture) => Ok(texture),
            Storage::Buffer(_) => Err(RenderError::Driver("texture access on a buffer".into())),
        }
    }
}

/// Texture levels kept as tightly packed rows in host memory.
#[derive(Debug)]
pub(crate) struct HostTexture {
    desc: StorageDesc,
    levels: Vec<Vec<u8>>,
}

impl HostTexture {
    pub(crate) fn new(desc: &StorageDesc) -> Self {
        let levels = (0..desc.mip_levels.max(1))
            .map(|level| {
                let (row, rows, slices) = level_geometry(desc, level);
                vec![0; row * rows * slices]
            })
            .collect();
        Self {
            desc: *desc,
            levels,
        }
    }

    pub(crate) fn format(&self) -> FormatDesc {
        self.desc.format
    }

    fn rows(&mut self, region: &TextureRegion) -> Result<(&mut Vec<u8>, Vec<(usize, usize)>)> {
        let desc = &self.desc;
        let (row, rows, slices) = level_geometry(desc, region.level);
        let bs = desc.format.block_size as usize;
        let bx = desc.format.block_width.max(1) as usize;
        let by = desc.format.block_height.max(1) as usize;
        let [x, y, z] = region.origin.map(|v| v as usize);
        let [w, h, d] = region.extent.map(|v| v as usize);
        let x0 = x / bx * bs;
        let span = w.div_ceil(bx) * bs;
        let y0 = y / by;
        let nrows = h.div_ceil(by);
        if x0 + span > row || y0 + nrows > rows || z + d.max(1) > slices {
            return Err(RenderError::Driver("texture region outside of level".into()));
        }
        let mut pieces = Vec::with_capacity(nrows * d.max(1));
        for slice in z..z + d.max(1) {
            for r in y0..y0 + nrows {
                pieces.push(((slice * rows + r) * row + x0, span));
            }
        }
        let level = self
            .levels
            .get_mut(region.level as usize)
            .ok_or_else(|| RenderError::Driver("mip level not allocated".into()))?;
        Ok((level, pieces))
    }

    pub(crate) fn write(&mut self, region: &TextureRegion, data: &[u8]) -> Result<()> {
        let (level, pieces) = self.rows(region)?;
        let mut src = 0;
        for (start, len) in pieces {
            let chunk = data
                .get(src..src + len)
                .ok_or_else(|| RenderError::Driver("texture upload too short".into()))?;
            level[start..start + len].copy_from_slice(chunk);
            src += len;
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, region: &TextureRegion, out: &mut [u8]) -> Result<()> {
        let (level, pieces) = self.rows(region)?;
        let mut dst = 0;
        for (start, len) in pieces {
            let chunk = out
                .get_mut(dst..dst + len)
                .ok_or_else(|| RenderError::Driver("readback buffer too short".into()))?;
            chunk.copy_from_slice(&level[start..start + len]);
            dst += len;
        }
        Ok(())
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn create_context(&mut self, ctx_id: u32, sub_ctx_id: u32) -> Result<NativeContext> {
        self.log.push(RecordedCall::CreateContext { ctx_id, sub_ctx_id });
        Ok(NativeContext(self.next()))
    }

    fn destroy_context(&mut self, context: NativeContext) {
        self.log.push(RecordedCall::DestroyContext(context));
    }

    fn make_current(&mut self, context: NativeContext) -> Result<()> {
        self.log.push(RecordedCall::MakeCurrent(context));
        Ok(())
    }

    fn create_storage(&mut self, desc: &StorageDesc) -> Result<NativeStorage> {
        self.log.push(RecordedCall::CreateStorage {
            handle: desc.handle,
            buffer: desc.is_buffer(),
        });
        let storage = if desc.is_buffer() {
            Storage::Buffer(vec![0; desc.width as usize])
        } else {
            Storage::Texture(HostTexture::new(desc))
        };
        let id = NativeStorage(self.next());
        self.storage.insert(id, storage);
        Ok(id)
    }

    fn release_storage(&mut self, storage: NativeStorage) {
        self.log.push(RecordedCall::ReleaseStorage(storage));
        self.storage.remove(&storage);
    }

    fn write_buffer(&mut self, storage: NativeStorage, offset: u64, data: &[u8]) -> Result<()> {
        self.log.push(RecordedCall::WriteBuffer {
            storage,
            offset,
            len: data.len(),
        });
        let Storage::Buffer(bytes) = self.storage_mut(storage)? else {
            return Err(RenderError::Driver("buffer write to a texture".into()));
        };
        let start = offset as usize;
        let dst = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| RenderError::Driver("buffer write out of range".into()))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, storage: NativeStorage, offset: u64, out: &mut [u8]) -> Result<()> {
        self.log.push(RecordedCall::ReadBuffer {
            storage,
            offset,
            len: out.len(),
        });
        let Storage::Buffer(bytes) = self.storage_mut(storage)? else {
            return Err(RenderError::Driver("buffer read from a texture".into()));
        };
        let start = offset as usize;
        let src = bytes
            .get(start..start + out.len())
            .ok_or_else(|| RenderError::Driver("buffer read out of range".into()))?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn write_texture(
        &mut self,
        storage: NativeStorage,
        region: &TextureRegion,
        data: &[u8],
    ) -> Result<()> {
        self.log.push(RecordedCall::WriteTexture {
            storage,
            region: *region,
        });
        self.texture_mut(storage)?.write(region, data)
    }

    fn read_texture(
        &mut self,
        storage: NativeStorage,
        region: &TextureRegion,
        out: &mut [u8],
    ) -> Result<()> {
        self.log.push(RecordedCall::ReadTexture {
            storage,
            region: *region,
        });
        self.texture_mut(storage)?.read(region, out)
    }

    fn create_fence(&mut self) -> Result<NativeFence> {
        let fence = NativeFence(self.next());
        self.fences.insert(fence, self.fence_latency);
        Ok(fence)
    }

    fn fence_signaled(&mut self, fence: NativeFence) -> bool {
        match self.fences.get_mut(&fence) {
            Some(0) | None => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
        }
    }

    fn release_fence(&mut self, fence: NativeFence) {
        self.fences.remove(&fence);
    }

    fn create_query(&mut self, kind: QueryKind) -> Result<NativeQuery> {
        self.log.push(RecordedCall::CreateQuery(kind));
        let query = NativeQuery(self.next());
        self.queries.create(query, kind);
        Ok(query)
    }

    fn query_result(&mut self, query: NativeQuery, _wait: bool) -> Result<Option<u64>> {
        self.queries.result(query)
    }

    fn release_query(&mut self, query: NativeQuery) {
        self.log.push(RecordedCall::ReleaseQuery(query));
        self.queries.release(query);
    }

    fn execute(&mut self, call: NativeCall) -> Result<()> {
        self.queries.observe(&call);
        self.log.push(RecordedCall::Execute(call));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{describe, R8_UNORM};

    fn texture_desc() -> StorageDesc {
        StorageDesc {
            handle: 1,
            target: Target::Texture2d,
            format: describe(R8_UNORM).unwrap(),
            width: 4,
            height: 4,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            samples: 1,
            buffer: None,
        }
    }

    #[test]
    fn texture_region_round_trips_through_storage() {
        let mut backend = NullBackend::new(0);
        let storage = backend.create_storage(&texture_desc()).unwrap();
        let region = TextureRegion {
            level: 0,
            origin: [1, 1, 0],
            extent: [2, 2, 1],
        };
        backend.write_texture(storage, &region, &[1, 2, 3, 4]).unwrap();

        let whole = TextureRegion {
            level: 0,
            origin: [0, 0, 0],
            extent: [4, 4, 1],
        };
        let mut out = [0u8; 16];
        backend.read_texture(storage, &whole, &mut out).unwrap();
        assert_eq!(out[5..7], [1, 2]);
        assert_eq!(out[9..11], [3, 4]);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn regions_outside_the_level_fail() {
        let mut backend = NullBackend::new(0);
        let storage = backend.create_storage(&texture_desc()).unwrap();
        let region = TextureRegion {
            level: 0,
            origin: [3, 0, 0],
            extent: [2, 1, 1],
        };
        assert!(backend.write_texture(storage, &region, &[0, 0]).is_err());
    }

    #[test]
    fn predicate_reports_draws_between_begin_and_end() {
        let mut backend = NullBackend::new(0);
        let query = backend.create_query(QueryKind::Predicate).unwrap();
        backend.execute(NativeCall::BeginQuery(query)).unwrap();
        assert_eq!(backend.query_result(query, false).unwrap(), None);
        backend
            .execute(NativeCall::Draw {
                targets: Default::default(),
                info: Default::default(),
                indirect: None,
            })
            .unwrap();
        backend.execute(NativeCall::EndQuery(query)).unwrap();
        assert_eq!(backend.query_result(query, false).unwrap(), Some(1));
        assert_eq!(backend.log().executed().len(), 3);
    }
}
