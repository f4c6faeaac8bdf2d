use std::collections::{HashMap, VecDeque};

use crate::backend::{Backend, NativeFence};
use crate::error::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    pub ctx_id: u32,
    pub fence_id: u32,
    pub native: NativeFence,
}

/// Fences in submission order.
///
/// Retirement walks from the oldest fence and stops at the first one the
/// backend has not signalled, so a later fence is never reported ahead of an
/// earlier one.
#[derive(Debug, Default)]
pub struct FenceList {
    pending: VecDeque<Fence>,
    last_created: HashMap<u32, u32>,
}

impl FenceList {
    pub fn create(&mut self, backend: &mut dyn Backend, ctx_id: u32, fence_id: u32) -> Result<()> {
        if let Some(last) = self.last_created.get(&ctx_id) {
            if fence_id <= *last {
                return Err(RenderError::invalid(format!(
                    "fence {fence_id} does not follow {last} on context {ctx_id}"
                )));
            }
        }
        let native = backend.create_fence()?;
        self.last_created.insert(ctx_id, fence_id);
        self.pending.push_back(Fence {
            ctx_id,
            fence_id,
            native,
        });
        tracing::trace!(ctx_id, fence_id, "fence created");
        Ok(())
    }

    /// Retires signalled fences and returns the newest retired id, if any.
    pub fn retire(&mut self, backend: &mut dyn Backend) -> Option<u32> {
        let mut latest = None;
        while let Some(fence) = self.pending.front().copied() {
            if !backend.fence_signaled(fence.native) {
                break;
            }
            self.pending.pop_front();
            backend.release_fence(fence.native);
            latest = Some(fence.fence_id);
        }
        latest
    }

    /// Drops a context's fences without waiting for them.
    pub fn abandon(&mut self, backend: &mut dyn Backend, ctx_id: u32) {
        self.pending.retain(|fence| {
            if fence.ctx_id == ctx_id {
                backend.release_fence(fence.native);
                false
            } else {
                true
            }
        });
        self.last_created.remove(&ctx_id);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
