//! Socket side of vgpud.
//!
//! A [`Connection`] reads framed requests from a Unix stream, drives a
//! per-client [`vrend::Renderer`] and answers on the same stream. Resource
//! backing is memfd shared memory whose descriptor travels to the client as
//! `SCM_RIGHTS` ancillary data.

mod connection;
mod error;
pub mod host;
pub mod shm;
pub mod wire;

pub use connection::{BackendFactory, Connection, ConnectionOptions, CLIENT_CTX_ID};
pub use error::ProtocolError;
pub use host::{Frontbuffer, HostHooks, LogHooks};
pub use wire::{Header, Opcode, Request};
