//! Queries and the host-memory result block they write.

use std::rc::Rc;

use crate::backend::{Backend, NativeCall, QueryKind};
use crate::context::Context;
use crate::decode::QueryBufferWrite;
use crate::error::{ContextError, RenderError, Result};
use crate::exec::context_mut;
use crate::object::{Object, ObjectKind, Query};
use crate::registry::{ReleaseQueue, ResourceRef};
use crate::renderer::{Renderer, WaitingQuery};

pub const QUERY_OCCLUSION_COUNTER: u32 = 0;
pub const QUERY_OCCLUSION_PREDICATE: u32 = 1;
pub const QUERY_OCCLUSION_PREDICATE_CONSERVATIVE: u32 = 2;
pub const QUERY_TIMESTAMP: u32 = 3;
pub const QUERY_TIMESTAMP_DISJOINT: u32 = 4;
pub const QUERY_TIME_ELAPSED: u32 = 5;
pub const QUERY_PRIMITIVES_GENERATED: u32 = 6;
pub const QUERY_PRIMITIVES_EMITTED: u32 = 7;
pub const QUERY_SO_STATISTICS: u32 = 8;
pub const QUERY_SO_OVERFLOW_PREDICATE: u32 = 9;
pub const QUERY_SO_OVERFLOW_ANY_PREDICATE: u32 = 10;

/// Scale applied to a boolean occlusion answer standing in for a sample count.
pub const FAKE_SAMPLES_PASSED: u64 = 1024;

pub const QUERY_STATE_DONE: u32 = 2;

/// Result types of GET_QUERY_RESULT_QBO.
const QBO_TYPE_I32: u32 = 0;
const QBO_TYPE_U32: u32 = 1;

/// Maps a guest query type onto what the backend runs. Occlusion counters are
/// answered by a predicate, flagged by the returned bool.
pub fn query_kind(query_type: u32) -> Result<(QueryKind, bool)> {
    let kind = match query_type {
        QUERY_OCCLUSION_COUNTER => return Ok((QueryKind::Predicate, true)),
        QUERY_OCCLUSION_PREDICATE => QueryKind::Predicate,
        QUERY_OCCLUSION_PREDICATE_CONSERVATIVE => QueryKind::PredicateConservative,
        QUERY_TIMESTAMP_DISJOINT => QueryKind::TimestampDisjoint,
        QUERY_PRIMITIVES_GENERATED => QueryKind::PrimitivesGenerated,
        QUERY_PRIMITIVES_EMITTED => QueryKind::PrimitivesEmitted,
        QUERY_SO_STATISTICS => QueryKind::StreamoutStatistics,
        QUERY_TIMESTAMP
        | QUERY_TIME_ELAPSED
        | QUERY_SO_OVERFLOW_PREDICATE
        | QUERY_SO_OVERFLOW_ANY_PREDICATE => {
            return Err(RenderError::invalid(format!(
                "query type {query_type} is not supported"
            )))
        }
        other => return Err(RenderError::invalid(format!("unknown query type {other}"))),
    };
    Ok((kind, false))
}

/// Builds a query object. Its result resource must be attached and live in
/// host memory.
pub(crate) fn new_query(
    backend: &mut dyn Backend,
    release: &ReleaseQueue,
    ctx: &mut Context,
    query_type: u32,
    index: u32,
    resource: u32,
) -> Result<Object> {
    let res = ctx
        .attachments
        .lookup(resource)
        .filter(|res| res.borrow().has_host_memory())
        .ok_or_else(|| {
            RenderError::invalid(format!("query result resource {resource} is unusable"))
        })?;
    let (kind, fake) = query_kind(query_type)?;
    let native = backend.create_query(kind)?;
    Ok(Object::Query(Rc::new(Query::new(
        kind,
        index,
        res,
        native,
        fake,
        release.clone(),
    ))))
}

fn lookup(ctx: &Context, handle: u32) -> Option<Rc<Query>> {
    match ctx.objects.lookup(handle, ObjectKind::Query) {
        Some(Object::Query(query)) => Some(query.clone()),
        _ => None,
    }
}

/// Writes `data` at `offset` of a resource's guest backing, or of its host
/// memory when it has none.
fn write_result(res: &ResourceRef, offset: usize, data: &[u8]) -> Result<()> {
    let mut res = res.borrow_mut();
    if let Some(iov) = &res.iov {
        return iov.write_exact(offset, data);
    }
    let handle = res.handle;
    let memory = res
        .host_memory
        .as_mut()
        .ok_or_else(|| RenderError::invalid(format!("resource {handle} has no memory")))?;
    let dst = memory
        .get_mut(offset..offset + data.len())
        .ok_or_else(|| RenderError::Fault(format!("query result outside resource {handle}")))?;
    dst.copy_from_slice(data);
    Ok(())
}

/// The block a finished query leaves in its result resource.
fn result_block(value: u64) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&QUERY_STATE_DONE.to_le_bytes());
    block[4..8].copy_from_slice(&4u32.to_le_bytes());
    block[8..16].copy_from_slice(&value.to_le_bytes());
    block
}

impl Renderer {
    fn active_query(&mut self, ctx_id: u32, handle: u32) -> Result<Rc<Query>> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let query = lookup(ctx, handle)
            .ok_or_else(|| RenderError::invalid(format!("no query {handle}")))?;
        if query.index > 0 {
            return Err(RenderError::invalid(format!(
                "query {handle} uses stream index {}",
                query.index
            )));
        }
        Ok(query)
    }

    pub(crate) fn begin_query(&mut self, ctx_id: u32, handle: u32) -> Result<()> {
        let query = self.active_query(ctx_id, handle)?;
        self.waiting_queries
            .retain(|waiting| !Rc::ptr_eq(&waiting.query, &query));
        self.switch_context(ctx_id)?;
        self.backend.execute(NativeCall::BeginQuery(query.native))?;
        query.active.set(true);
        Ok(())
    }

    pub(crate) fn end_query(&mut self, ctx_id: u32, handle: u32) -> Result<()> {
        let query = self.active_query(ctx_id, handle)?;
        self.switch_context(ctx_id)?;
        self.backend.execute(NativeCall::EndQuery(query.native))?;
        query.active.set(false);
        Ok(())
    }

    /// Publishes the result if the backend has it, otherwise parks the query
    /// until a later fence check. Unknown handles are ignored.
    pub(crate) fn get_query_result(&mut self, ctx_id: u32, handle: u32) -> Result<()> {
        let Some(query) = lookup(context_mut(&mut self.contexts, ctx_id)?, handle) else {
            return Ok(());
        };
        if self.check_query(&query)? {
            self.waiting_queries
                .retain(|waiting| !Rc::ptr_eq(&waiting.query, &query));
        } else if !self
            .waiting_queries
            .iter()
            .any(|waiting| Rc::ptr_eq(&waiting.query, &query))
        {
            self.waiting_queries.push(WaitingQuery { ctx_id, query });
        }
        Ok(())
    }

    /// Copies a query result into a buffer resource.
    ///
    /// A negative `index` asks for availability instead of the value.
    pub(crate) fn get_query_result_qbo(&mut self, ctx_id: u32, write: QueryBufferWrite) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let Some(query) = lookup(ctx, write.handle) else {
            return Ok(());
        };
        let Some(qbo) = ctx.attachments.lookup(write.qbo_handle) else {
            ctx.report_error(ContextError::IllegalResource(write.qbo_handle));
            return Ok(());
        };
        let result = self.backend.query_result(query.native, write.wait)?;
        let value = match (write.index < 0, result) {
            (true, result) => u64::from(result.is_some()),
            (false, Some(value)) if query.fake_samples_passed => value * FAKE_SAMPLES_PASSED,
            (false, Some(value)) => value,
            (false, None) => return Ok(()),
        };
        let bytes = match write.result_type {
            QBO_TYPE_I32 => (value.min(i32::MAX as u64) as u32).to_le_bytes().to_vec(),
            QBO_TYPE_U32 => (value.min(u32::MAX as u64) as u32).to_le_bytes().to_vec(),
            _ => value.to_le_bytes().to_vec(),
        };

        let native = qbo.borrow().native;
        match native {
            Some(storage) => self
                .backend
                .write_buffer(storage, u64::from(write.offset), &bytes),
            None => write_result(&qbo, write.offset as usize, &bytes),
        }
    }

    /// Polls one query without blocking and writes the result block once it
    /// is available.
    fn check_query(&mut self, query: &Query) -> Result<bool> {
        let Some(mut value) = self.backend.query_result(query.native, false)? else {
            return Ok(false);
        };
        if query.fake_samples_passed {
            value *= FAKE_SAMPLES_PASSED;
        }
        write_result(&query.resource, 0, &result_block(value))?;
        Ok(true)
    }

    /// Re-checks every parked query, dropping those that completed.
    pub(crate) fn check_queries(&mut self) {
        let waiting = std::mem::take(&mut self.waiting_queries);
        let mut still_waiting = Vec::with_capacity(waiting.len());
        for entry in waiting {
            if let Err(err) = self.switch_context(entry.ctx_id) {
                tracing::debug!(ctx_id = entry.ctx_id, %err, "cannot switch to check query");
                still_waiting.push(entry);
                continue;
            }
            match self.check_query(&entry.query) {
                Ok(true) => {}
                Ok(false) => still_waiting.push(entry),
                Err(err) => {
                    tracing::warn!(ctx_id = entry.ctx_id, %err, "query result write failed");
                }
            }
        }
        self.waiting_queries = still_waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{command_header, Opcode};
    use crate::format::R8_UNORM;
    use crate::iov::IovecSet;
    use crate::null::NullBackend;
    use crate::renderer::RendererConfig;
    use crate::resource::{BindFlags, ResourceCreateArgs};

    fn cmd(opcode: Opcode, object: u32, args: &[u32]) -> Vec<u32> {
        let mut out = vec![command_header(opcode, object, args.len() as u16)];
        out.extend_from_slice(args);
        out
    }

    fn setup(bind: BindFlags) -> Renderer {
        let mut r =
            Renderer::new(Box::new(NullBackend::new(0)), RendererConfig::default()).unwrap();
        r.create_context(1, "query").unwrap();
        let args = ResourceCreateArgs {
            handle: 8,
            target: 0,
            format: R8_UNORM,
            bind: bind.bits(),
            width: 16,
            height: 1,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        r.resource_create(&args).unwrap();
        r.attach_resource(1, 8).unwrap();
        r
    }

    fn host_block(r: &Renderer) -> Vec<u8> {
        let res = r.resource(8).unwrap();
        let res = res.borrow();
        res.host_memory.clone().unwrap()
    }

    #[test]
    fn kinds_follow_query_types() {
        assert_eq!(
            query_kind(QUERY_OCCLUSION_COUNTER).unwrap(),
            (QueryKind::Predicate, true)
        );
        assert_eq!(
            query_kind(QUERY_PRIMITIVES_EMITTED).unwrap(),
            (QueryKind::PrimitivesEmitted, false)
        );
        assert!(query_kind(QUERY_TIMESTAMP).is_err());
        assert!(query_kind(QUERY_SO_OVERFLOW_ANY_PREDICATE).is_err());
        assert!(query_kind(40).is_err());
    }

    #[test]
    fn query_needs_host_memory_resource() {
        let mut r = setup(BindFlags::VERTEX_BUFFER);
        let err = r
            .submit(1, &cmd(Opcode::CreateObject, 9, &[5, QUERY_OCCLUSION_COUNTER, 0, 8]))
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidArgument(_)));
    }

    #[test]
    fn occlusion_counter_result_is_scaled() {
        let mut r = setup(BindFlags::CUSTOM);
        let mut batch = cmd(Opcode::CreateObject, 9, &[5, QUERY_OCCLUSION_COUNTER, 0, 8]);
        batch.extend(cmd(Opcode::BeginQuery, 0, &[5]));
        batch.extend(cmd(Opcode::DrawVbo, 0, &[0, 3, 4, 0, 1, 0, 0, 0, 0, 0, 2, 0]));
        batch.extend(cmd(Opcode::EndQuery, 0, &[5]));
        batch.extend(cmd(Opcode::GetQueryResult, 0, &[5, 0]));
        r.submit(1, &batch).unwrap();

        let block = host_block(&r);
        assert_eq!(&block[0..4], &QUERY_STATE_DONE.to_le_bytes());
        assert_eq!(&block[4..8], &4u32.to_le_bytes());
        let value = u64::from_le_bytes(block[8..16].try_into().unwrap());
        assert_eq!(value % FAKE_SAMPLES_PASSED, 0);
        assert!(r.waiting_queries.is_empty());
    }

    #[test]
    fn stream_indexed_queries_cannot_begin() {
        let mut r = setup(BindFlags::CUSTOM);
        let type_index = QUERY_PRIMITIVES_EMITTED | (1 << 16);
        r.submit(1, &cmd(Opcode::CreateObject, 9, &[5, type_index, 0, 8]))
            .unwrap();
        assert!(r.submit(1, &cmd(Opcode::BeginQuery, 0, &[5])).is_err());
    }

    #[test]
    fn unknown_query_result_is_ignored() {
        let mut r = setup(BindFlags::CUSTOM);
        r.submit(1, &cmd(Opcode::GetQueryResult, 0, &[77, 1])).unwrap();
        assert!(r.waiting_queries.is_empty());
    }

    #[test]
    fn result_goes_to_guest_backing_when_attached() {
        let mut r = setup(BindFlags::CUSTOM);
        let backing = IovecSet::single(vec![0u8; 16]);
        r.attach_iov(8, backing.clone()).unwrap();
        let mut batch = cmd(Opcode::CreateObject, 9, &[5, QUERY_PRIMITIVES_GENERATED, 0, 8]);
        batch.extend(cmd(Opcode::BeginQuery, 0, &[5]));
        batch.extend(cmd(Opcode::EndQuery, 0, &[5]));
        batch.extend(cmd(Opcode::GetQueryResult, 0, &[5, 0]));
        r.submit(1, &batch).unwrap();
        let mut state = [0u8; 4];
        backing.read(0, &mut state);
        assert_eq!(state, QUERY_STATE_DONE.to_le_bytes());
    }
}
