//! Scatter/gather primitives over ordered span arrays.
//!
//! All primitives try to move exactly the requested number of bytes and return
//! how many were actually moved; a short count means the span set ended before
//! `offset + count`. Callers compare the result against the request.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{RenderError, Result};

/// A contiguous block of guest-visible memory.
pub trait IoSpan {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IoSpan for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl<T: IoSpan + ?Sized> IoSpan for Box<T> {
    fn bytes(&self) -> &[u8] {
        (**self).bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        (**self).bytes_mut()
    }
}

pub fn size<S: IoSpan>(spans: &[S]) -> usize {
    spans.iter().map(IoSpan::len).sum()
}

/// Walks the spans starting at `offset`, yielding `(span index, start, len)`
/// chunks covering at most `count` bytes.
fn chunks<S: IoSpan>(spans: &[S], mut offset: usize, count: usize) -> Vec<(usize, usize, usize)> {
    let mut out = Vec::new();
    let mut remaining = count;
    for (index, span) in spans.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let len = span.len();
        if offset >= len {
            offset -= len;
            continue;
        }
        let take = (len - offset).min(remaining);
        out.push((index, offset, take));
        remaining -= take;
        offset = 0;
    }
    out
}

pub fn read<S: IoSpan>(spans: &[S], offset: usize, out: &mut [u8]) -> usize {
    let mut moved = 0;
    for (index, start, len) in chunks(spans, offset, out.len()) {
        out[moved..moved + len].copy_from_slice(&spans[index].bytes()[start..start + len]);
        moved += len;
    }
    moved
}

pub fn write<S: IoSpan>(spans: &mut [S], offset: usize, data: &[u8]) -> usize {
    let mut moved = 0;
    for (index, start, len) in chunks(spans, offset, data.len()) {
        spans[index].bytes_mut()[start..start + len].copy_from_slice(&data[moved..moved + len]);
        moved += len;
    }
    moved
}

/// Hands each covered piece to `f` without staging it in a temporary buffer.
pub fn read_with<S, F>(spans: &[S], offset: usize, count: usize, mut f: F) -> usize
where
    S: IoSpan,
    F: FnMut(&[u8]),
{
    let mut moved = 0;
    for (index, start, len) in chunks(spans, offset, count) {
        f(&spans[index].bytes()[start..start + len]);
        moved += len;
    }
    moved
}

/// Shared, identity-carrying span set attached to a resource.
///
/// Clones refer to the same memory; [`IovecSet::same_set`] compares identity.
#[derive(Clone)]
pub struct IovecSet {
    spans: Rc<RefCell<Vec<Box<dyn IoSpan>>>>,
}

impl IovecSet {
    pub fn new(spans: Vec<Box<dyn IoSpan>>) -> Self {
        Self {
            spans: Rc::new(RefCell::new(spans)),
        }
    }

    pub fn single(span: impl IoSpan + 'static) -> Self {
        Self::new(vec![Box::new(span)])
    }

    pub fn size(&self) -> usize {
        size(&self.spans.borrow()[..])
    }

    pub fn span_count(&self) -> usize {
        self.spans.borrow().len()
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        read(&self.spans.borrow()[..], offset, out)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        write(&mut self.spans.borrow_mut()[..], offset, data)
    }

    pub fn read_with<F: FnMut(&[u8])>(&self, offset: usize, count: usize, f: F) -> usize {
        read_with(&self.spans.borrow()[..], offset, count, f)
    }

    pub fn same_set(&self, other: &IovecSet) -> bool {
        Rc::ptr_eq(&self.spans, &other.spans)
    }

    /// Reads exactly `out.len()` bytes or fails.
    pub fn read_exact(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let moved = self.read(offset, out);
        if moved != out.len() {
            return Err(RenderError::Fault(format!(
                "short read of {moved}/{} bytes at offset {offset}",
                out.len()
            )));
        }
        Ok(())
    }

    /// Writes exactly `data.len()` bytes or fails.
    pub fn write_exact(&self, offset: usize, data: &[u8]) -> Result<()> {
        let moved = self.write(offset, data);
        if moved != data.len() {
            return Err(RenderError::Fault(format!(
                "short write of {moved}/{} bytes at offset {offset}",
                data.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for IovecSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IovecSet")
            .field("spans", &self.span_count())
            .field("size", &self.size())
            .finish()
    }
}

/// Copies `count` bytes between two span sets through `scratch`.
///
/// Copying a set onto itself at the same offset is a no-op.
pub fn copy_iovec(
    src: &IovecSet,
    src_offset: usize,
    dst: &IovecSet,
    dst_offset: usize,
    count: usize,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    if src.same_set(dst) && src_offset == dst_offset {
        return Ok(());
    }
    scratch.clear();
    scratch.resize(count, 0);
    src.read_exact(src_offset, scratch)?;
    dst.write_exact(dst_offset, scratch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_set() -> Vec<Vec<u8>> {
        vec![vec![0; 3], vec![0; 5], vec![0; 2]]
    }

    #[test]
    fn write_then_read_crosses_span_boundaries() {
        let mut spans = split_set();
        assert_eq!(size(&spans), 10);
        let data = [1, 2, 3, 4, 5, 6];
        assert_eq!(write(&mut spans, 2, &data), 6);
        assert_eq!(spans[0], vec![0, 0, 1]);
        assert_eq!(spans[1], vec![2, 3, 4, 5, 6]);

        let mut out = [0u8; 6];
        assert_eq!(read(&spans, 2, &mut out), 6);
        assert_eq!(out, data);
    }

    #[test]
    fn short_set_reports_bytes_actually_moved() {
        let mut spans = split_set();
        assert_eq!(write(&mut spans, 7, &[9; 8]), 3);
        let mut out = [0u8; 8];
        assert_eq!(read(&spans, 7, &mut out), 3);
        assert_eq!(&out[..3], &[9, 9, 9]);
        assert_eq!(read(&spans, 10, &mut out), 0);
    }

    #[test]
    fn read_with_visits_each_piece() {
        let spans = vec![vec![1u8, 2], vec![3u8, 4, 5]];
        let mut pieces = Vec::new();
        let moved = read_with(&spans, 1, 3, |piece| pieces.push(piece.to_vec()));
        assert_eq!(moved, 3);
        assert_eq!(pieces, vec![vec![2], vec![3, 4]]);
    }

    #[test]
    fn copy_between_sets_and_same_set_noop() {
        let src = IovecSet::single(vec![7u8; 16]);
        let spans: Vec<Box<dyn IoSpan>> = vec![Box::new(vec![0u8; 4]), Box::new(vec![0u8; 12])];
        let dst = IovecSet::new(spans);
        let mut scratch = Vec::new();
        copy_iovec(&src, 2, &dst, 1, 10, &mut scratch).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(dst.read(0, &mut out), 16);
        assert_eq!(out[0], 0);
        assert!(out[1..11].iter().all(|b| *b == 7));
        assert_eq!(out[11], 0);

        let alias = src.clone();
        assert!(alias.same_set(&src));
        copy_iovec(&src, 0, &alias, 0, 64, &mut scratch).unwrap();
    }

    #[test]
    fn copy_past_end_fails() {
        let src = IovecSet::single(vec![1u8; 4]);
        let dst = IovecSet::single(vec![0u8; 8]);
        let mut scratch = Vec::new();
        let err = copy_iovec(&src, 0, &dst, 0, 6, &mut scratch).unwrap_err();
        assert!(matches!(err, RenderError::Fault(_)));
    }
}
