use bitflags::bitflags;
use serde::Serialize;

use crate::backend::{BufferKind, NativeStorage, StorageDesc};
use crate::error::{RenderError, Result};
use crate::format::{self, FormatDesc};
use crate::iov::IovecSet;
use crate::registry::ReleaseQueue;

/// Resource created with row 0 at the top of the image.
pub const RESOURCE_Y_0_TOP: u32 = 1 << 0;

bitflags! {
    /// Usage bits a guest attaches to a resource at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const DEPTH_STENCIL = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const SAMPLER_VIEW = 1 << 3;
        const VERTEX_BUFFER = 1 << 4;
        const INDEX_BUFFER = 1 << 5;
        const CONSTANT_BUFFER = 1 << 6;
        const DISPLAY_TARGET = 1 << 7;
        const COMMAND_ARGS = 1 << 8;
        const STREAM_OUTPUT = 1 << 11;
        const SHADER_BUFFER = 1 << 14;
        const QUERY_BUFFER = 1 << 15;
        const CURSOR = 1 << 16;
        const CUSTOM = 1 << 17;
        const SCANOUT = 1 << 18;
        const STAGING = 1 << 19;
        const SHARED = 1 << 20;
        const PREFER_EMULATED_BGRA = 1 << 21;
        const LINEAR = 1 << 22;
    }
}

bitflags! {
    /// Where a resource's contents live. Guest memory is always present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StorageFlags: u32 {
        const GUEST_MEMORY = 1 << 0;
        const HOST_SYSTEM_MEMORY = 1 << 1;
        const API_BUFFER = 1 << 2;
        const API_TEXTURE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Buffer,
    Texture1d,
    Texture2d,
    Texture3d,
    TextureCube,
    TextureRect,
    Texture1dArray,
    Texture2dArray,
    TextureCubeArray,
}

impl Target {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Target::Buffer,
            1 => Target::Texture1d,
            2 => Target::Texture2d,
            3 => Target::Texture3d,
            4 => Target::TextureCube,
            5 => Target::TextureRect,
            6 => Target::Texture1dArray,
            7 => Target::Texture2dArray,
            8 => Target::TextureCubeArray,
            _ => return None,
        })
    }

    pub fn is_array(self) -> bool {
        matches!(
            self,
            Target::Texture1dArray | Target::Texture2dArray | Target::TextureCubeArray
        )
    }

    pub fn is_cube(self) -> bool {
        matches!(self, Target::TextureCube | Target::TextureCubeArray)
    }
}

/// Maximum texture extents the renderer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureLimits {
    pub max_2d: u32,
    pub max_3d: u32,
    pub max_cube: u32,
}

impl Default for TextureLimits {
    fn default() -> Self {
        Self {
            max_2d: 16384,
            max_3d: 2048,
            max_cube: 16384,
        }
    }
}

/// Arguments of a resource creation request, as sent by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCreateArgs {
    pub handle: u32,
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
}

fn reject(args: &ResourceCreateArgs, reason: &str) -> RenderError {
    RenderError::invalid(format!("resource {}: {reason}", args.handle))
}

/// Binds that make a resource a plain buffer.
fn is_buffer_bind(bind: u32) -> bool {
    bind == 0
        || [
            BindFlags::CUSTOM,
            BindFlags::STAGING,
            BindFlags::INDEX_BUFFER,
            BindFlags::STREAM_OUTPUT,
            BindFlags::VERTEX_BUFFER,
            BindFlags::CONSTANT_BUFFER,
            BindFlags::QUERY_BUFFER,
            BindFlags::COMMAND_ARGS,
            BindFlags::SHADER_BUFFER,
        ]
        .iter()
        .any(|flag| flag.bits() == bind)
}

fn floor_log2(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        31 - value.leading_zeros()
    }
}

/// Checks a creation request before anything is allocated.
pub fn validate(args: &ResourceCreateArgs, limits: &TextureLimits) -> Result<(Target, FormatDesc)> {
    if args.handle == 0 {
        return Err(reject(args, "handle 0 is reserved"));
    }
    let target = Target::from_raw(args.target).ok_or_else(|| reject(args, "unknown target"))?;
    if args.format >= format::FORMAT_MAX {
        return Err(reject(args, "format out of range"));
    }
    let desc = format::describe(args.format).ok_or_else(|| reject(args, "unsupported format"))?;

    if args.nr_samples > 0 {
        if target != Target::Texture2d && target != Target::Texture2dArray {
            return Err(reject(args, "only 2D targets may be multisampled"));
        }
        if args.last_level > 0 {
            return Err(reject(args, "multisampled resources cannot have mipmaps"));
        }
    }

    if args.last_level > 0 {
        if target == Target::Buffer || target == Target::TextureRect {
            return Err(reject(args, "target cannot have mipmaps"));
        }
        if args.last_level > floor_log2(args.width.max(args.height)) + 1 {
            return Err(reject(args, "too many mip levels"));
        }
    }

    if args.flags != 0 && args.flags != RESOURCE_Y_0_TOP {
        return Err(reject(args, "unknown flags"));
    }
    if args.flags & RESOURCE_Y_0_TOP != 0
        && target != Target::Texture2d
        && target != Target::TextureRect
    {
        return Err(reject(args, "y-0-top only applies to 2D textures"));
    }

    match target {
        Target::TextureCube if args.array_size != 6 => {
            return Err(reject(args, "cube maps need six faces"));
        }
        Target::TextureCubeArray if args.array_size % 6 != 0 => {
            return Err(reject(args, "cube arrays need a multiple of six faces"));
        }
        Target::TextureCube | Target::TextureCubeArray => {}
        _ if args.array_size > 1 && !target.is_array() => {
            return Err(reject(args, "array size on a non-array target"));
        }
        _ => {}
    }

    if is_buffer_bind(args.bind) {
        if target != Target::Buffer {
            return Err(reject(args, "buffer binding on a texture target"));
        }
        if args.height != 1 || args.depth != 1 {
            return Err(reject(args, "buffers are one-dimensional"));
        }
        if args.bind == BindFlags::QUERY_BUFFER.bits() {
            return Err(reject(args, "query buffers are not supported"));
        }
        return Ok((target, desc));
    }

    let bind = BindFlags::from_bits_retain(args.bind);
    let usable = BindFlags::SAMPLER_VIEW
        | BindFlags::DEPTH_STENCIL
        | BindFlags::RENDER_TARGET
        | BindFlags::CURSOR
        | BindFlags::SHARED
        | BindFlags::LINEAR;
    if !bind.intersects(usable) {
        return Err(reject(args, "no usable binding"));
    }

    match target {
        Target::Texture2d | Target::TextureRect | Target::Texture2dArray => {
            if args.depth != 1 {
                return Err(reject(args, "2D textures have depth 1"));
            }
            if args.width > limits.max_2d || args.height > limits.max_2d {
                return Err(reject(args, "2D texture too large"));
            }
        }
        Target::TextureCube | Target::TextureCubeArray => {
            if args.depth != 1 {
                return Err(reject(args, "cube textures have depth 1"));
            }
            if args.width != args.height {
                return Err(reject(args, "cube faces must be square"));
            }
            if args.width > limits.max_cube {
                return Err(reject(args, "cube texture too large"));
            }
        }
        Target::Texture1d | Target::Texture1dArray => {
            if args.height != 1 || args.depth != 1 {
                return Err(reject(args, "1D textures have height and depth 1"));
            }
            if args.width > limits.max_2d {
                return Err(reject(args, "1D texture too large"));
            }
        }
        Target::Texture3d => {
            if args.width > limits.max_3d || args.height > limits.max_3d || args.depth > limits.max_3d
            {
                return Err(reject(args, "3D texture too large"));
            }
        }
        Target::Buffer => {}
    }
    Ok((target, desc))
}

/// Backing layout chosen for a validated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePlan {
    HostMemory,
    GuestOnly,
    Buffer(BufferKind),
    Texture,
}

pub fn plan_storage(target: Target, bind: u32) -> Result<StoragePlan> {
    if target != Target::Buffer {
        return Ok(StoragePlan::Texture);
    }
    let flags = BindFlags::from_bits_retain(bind);
    let plan = if bind == BindFlags::CUSTOM.bits() {
        StoragePlan::HostMemory
    } else if bind == BindFlags::STAGING.bits() {
        StoragePlan::GuestOnly
    } else if bind == BindFlags::INDEX_BUFFER.bits() {
        StoragePlan::Buffer(BufferKind::Index)
    } else if bind == BindFlags::STREAM_OUTPUT.bits() {
        StoragePlan::Buffer(BufferKind::StreamOutput)
    } else if bind == BindFlags::VERTEX_BUFFER.bits() {
        StoragePlan::Buffer(BufferKind::Vertex)
    } else if bind == BindFlags::CONSTANT_BUFFER.bits() {
        StoragePlan::Buffer(BufferKind::Uniform)
    } else if bind == BindFlags::COMMAND_ARGS.bits() {
        StoragePlan::Buffer(BufferKind::Indirect)
    } else if bind == 0 || bind == BindFlags::SHADER_BUFFER.bits() {
        StoragePlan::Buffer(BufferKind::Storage)
    } else if flags.contains(BindFlags::SAMPLER_VIEW) {
        StoragePlan::Buffer(BufferKind::Texel)
    } else {
        return Err(RenderError::invalid(format!(
            "no buffer storage for bind {bind:#x}"
        )));
    };
    Ok(plan)
}

/// A guest resource and everything backing it.
///
/// The native storage is handed back to the backend through the release queue
/// when the last reference drops.
#[derive(Debug)]
pub struct Resource {
    pub handle: u32,
    pub target: Target,
    pub format: FormatDesc,
    pub bind: BindFlags,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub y_0_top: bool,
    pub storage: StorageFlags,
    pub iov: Option<IovecSet>,
    pub host_memory: Option<Vec<u8>>,
    pub native: Option<NativeStorage>,
    release: ReleaseQueue,
}

impl Resource {
    pub(crate) fn new(
        args: &ResourceCreateArgs,
        target: Target,
        format: FormatDesc,
        release: ReleaseQueue,
    ) -> Self {
        Self {
            handle: args.handle,
            target,
            format,
            bind: BindFlags::from_bits_retain(args.bind),
            width: args.width,
            height: args.height,
            depth: args.depth,
            array_size: args.array_size.max(1),
            last_level: args.last_level,
            nr_samples: args.nr_samples,
            y_0_top: args.flags & RESOURCE_Y_0_TOP != 0,
            storage: StorageFlags::GUEST_MEMORY,
            iov: None,
            host_memory: None,
            native: None,
            release,
        }
    }

    pub fn storage_desc(&self) -> StorageDesc {
        StorageDesc {
            handle: self.handle,
            target: self.target,
            format: self.format,
            width: self.width,
            height: self.height,
            depth: self.depth,
            array_size: self.array_size,
            mip_levels: self.last_level + 1,
            samples: self.nr_samples.max(1),
            buffer: None,
        }
    }

    /// Extent of `level` along one axis.
    pub fn level_extent(value: u32, level: u32) -> u32 {
        value.checked_shr(level).unwrap_or(0).max(1)
    }

    pub fn level_width(&self, level: u32) -> u32 {
        Self::level_extent(self.width, level)
    }

    pub fn level_height(&self, level: u32) -> u32 {
        Self::level_extent(self.height, level)
    }

    pub fn level_depth(&self, level: u32) -> u32 {
        if self.target == Target::Texture3d {
            Self::level_extent(self.depth, level)
        } else {
            1
        }
    }

    /// Number of layers a transfer may address at `level`.
    pub fn level_layers(&self, level: u32) -> u32 {
        if self.target == Target::Texture3d {
            self.level_depth(level)
        } else {
            self.array_size
        }
    }

    pub fn has_host_memory(&self) -> bool {
        self.storage.contains(StorageFlags::HOST_SYSTEM_MEMORY)
    }

    pub fn is_guest_only(&self) -> bool {
        self.storage == StorageFlags::GUEST_MEMORY
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            self.release.push_storage(native);
        }
    }
}
