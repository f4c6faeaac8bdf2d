//! Handle tables: global resources, per-context objects and per-context
//! resource attachments.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::backend::{NativeQuery, NativeStorage};
use crate::error::{RenderError, Result};
use crate::object::{Object, ObjectKind};
use crate::resource::Resource;

pub type ResourceRef = Rc<RefCell<Resource>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Storage(NativeStorage),
    Query(NativeQuery),
}

/// Native handles whose owners were dropped, waiting to be returned to the
/// backend by the renderer.
#[derive(Clone, Default)]
pub struct ReleaseQueue {
    pending: Rc<RefCell<Vec<Released>>>,
}

impl ReleaseQueue {
    pub fn push_storage(&self, storage: NativeStorage) {
        self.pending.borrow_mut().push(Released::Storage(storage));
    }

    pub fn push_query(&self, query: NativeQuery) {
        self.pending.borrow_mut().push(Released::Query(query));
    }

    pub fn drain(&self) -> Vec<Released> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

impl fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseQueue")
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

/// Global resources keyed by handle. Entries hold one reference; the resource
/// itself is freed once attachments and bindings let go as well.
#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: HashMap<u32, ResourceRef>,
}

impl ResourceTable {
    pub fn insert(&mut self, resource: Resource) -> Result<ResourceRef> {
        let handle = resource.handle;
        if handle == 0 || self.entries.contains_key(&handle) {
            return Err(RenderError::DuplicateHandle(handle));
        }
        let entry = Rc::new(RefCell::new(resource));
        self.entries.insert(handle, Rc::clone(&entry));
        Ok(entry)
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn lookup(&self, handle: u32) -> Option<ResourceRef> {
        self.entries.get(&handle).cloned()
    }

    pub fn remove(&mut self, handle: u32) -> Option<ResourceRef> {
        self.entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Resources a context may name in its command stream.
#[derive(Debug, Default)]
pub struct AttachmentTable {
    entries: HashMap<u32, ResourceRef>,
}

impl AttachmentTable {
    /// Attaching twice is harmless.
    pub fn attach(&mut self, resource: ResourceRef) {
        let handle = resource.borrow().handle;
        self.entries.insert(handle, resource);
    }

    pub fn detach(&mut self, handle: u32) -> bool {
        self.entries.remove(&handle).is_some()
    }

    pub fn lookup(&self, handle: u32) -> Option<ResourceRef> {
        self.entries.get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug)]
struct ObjectEntry {
    sub_ctx: u32,
    object: Object,
}

/// Context-private objects. Each entry remembers the sub-context that created
/// it so sub-context teardown can drop them together.
#[derive(Debug, Default)]
pub struct ObjectTable {
    entries: HashMap<u32, ObjectEntry>,
}

impl ObjectTable {
    pub fn insert(&mut self, handle: u32, sub_ctx: u32, object: Object) -> Result<()> {
        if handle == 0 || self.entries.contains_key(&handle) {
            return Err(RenderError::DuplicateHandle(handle));
        }
        self.entries.insert(handle, ObjectEntry { sub_ctx, object });
        Ok(())
    }

    /// Finds `handle` only if it holds an object of `kind`.
    pub fn lookup(&self, handle: u32, kind: ObjectKind) -> Option<&Object> {
        self.entries
            .get(&handle)
            .map(|entry| &entry.object)
            .filter(|object| object.kind() == kind)
    }

    pub fn lookup_mut(&mut self, handle: u32, kind: ObjectKind) -> Option<&mut Object> {
        self.entries
            .get_mut(&handle)
            .map(|entry| &mut entry.object)
            .filter(|object| object.kind() == kind)
    }

    pub fn remove(&mut self, handle: u32) -> Option<Object> {
        self.entries.remove(&handle).map(|entry| entry.object)
    }

    /// Drops every object created by `sub_ctx`, returning how many went.
    pub fn remove_sub_ctx(&mut self, sub_ctx: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.sub_ctx != sub_ctx);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::format::R8_UNORM;
    use crate::object::{BlendState, DepthStencilState};
    use crate::resource::{validate, BindFlags, ResourceCreateArgs, TextureLimits};

    fn buffer(handle: u32, release: &ReleaseQueue) -> Resource {
        let args = ResourceCreateArgs {
            handle,
            format: R8_UNORM,
            bind: BindFlags::VERTEX_BUFFER.bits(),
            width: 64,
            height: 1,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        let (target, format) = validate(&args, &TextureLimits::default()).unwrap();
        Resource::new(&args, target, format, release.clone())
    }

    #[test]
    fn duplicate_handle_rejected_until_destroyed() {
        let release = ReleaseQueue::default();
        let mut table = ResourceTable::default();
        table.insert(buffer(5, &release)).unwrap();
        let err = table.insert(buffer(5, &release)).unwrap_err();
        assert_eq!(err, RenderError::DuplicateHandle(5));
        assert!(table.remove(5).is_some());
        table.insert(buffer(5, &release)).unwrap();
    }

    #[test]
    fn attachment_keeps_resource_alive_after_unref() {
        let release = ReleaseQueue::default();
        let mut table = ResourceTable::default();
        let res = table.insert(buffer(9, &release)).unwrap();
        res.borrow_mut().native = Some(NativeStorage(42));

        let mut attached = AttachmentTable::default();
        attached.attach(Rc::clone(&res));
        drop(res);

        table.remove(9);
        assert!(release.is_empty());
        assert!(attached.detach(9));
        assert_eq!(release.drain(), vec![Released::Storage(NativeStorage(42))]);
    }

    #[test]
    fn objects_are_typed_and_scoped_to_sub_contexts() {
        let mut objects = ObjectTable::default();
        objects
            .insert(1, 0, Object::Blend(Rc::new(BlendState::default())))
            .unwrap();
        objects
            .insert(2, 3, Object::DepthStencil(Rc::new(DepthStencilState::default())))
            .unwrap();
        assert!(objects
            .insert(0, 0, Object::Blend(Rc::new(BlendState::default())))
            .is_err());

        assert!(objects.lookup(1, ObjectKind::Blend).is_some());
        assert!(objects.lookup(1, ObjectKind::Rasterizer).is_none());

        assert_eq!(objects.remove_sub_ctx(3), 1);
        assert!(objects.lookup(2, ObjectKind::DepthStencil).is_none());
        assert_eq!(objects.len(), 1);
    }
}
