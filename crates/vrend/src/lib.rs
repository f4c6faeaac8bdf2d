//! Renderer core of the vgpud virtual GPU server.
//!
//! A client talks to one [`Renderer`]: it creates resources, attaches guest
//! memory to them and submits command batches for a rendering context. The
//! flow through the crate is:
//!
//! ```text
//!   submit(ctx, words)
//!          │
//!          ▼
//!   decode::parse ──▶ Command ──▶ Renderer::apply ──▶ Context / SubContext state
//!                                        │
//!                                        └─▶ draw / clear / query ──▶ dyn Backend
//! ```
//!
//! Handles, reference counts and validation all live here. A [`Backend`] only
//! receives native ids and checked arguments, which keeps the wgpu device and
//! the recording [`NullBackend`] interchangeable.

pub mod backend;
pub mod caps;
pub mod context;
pub mod decode;
mod draw;
pub mod error;
mod exec;
pub mod fence;
pub mod format;
#[cfg(feature = "wgpu-backend")]
pub mod gpu;
pub mod iov;
pub mod null;
pub mod object;
mod query;
pub mod registry;
mod renderer;
pub mod resource;
pub mod shader;
pub mod transfer;

pub use backend::{Backend, BackendLimits, NativeCall, StateUpdate};
pub use caps::CapsSet;
pub use error::{ContextError, RenderError, Result};
pub use iov::{IoSpan, IovecSet};
pub use null::{CallLog, NullBackend, RecordedCall};
pub use registry::ResourceRef;
pub use renderer::{Renderer, RendererConfig, DEFAULT_MAX_COMMAND_WORDS};
pub use resource::{ResourceCreateArgs, TextureLimits, RESOURCE_Y_0_TOP};
pub use transfer::{TransferBox, TransferDirection, TransferInfo};
