//! Transfer descriptors, bounds checks and the packing between a tightly
//! packed box and a resource's row/layer layout in guest memory.

use crate::error::{RenderError, Result};
use crate::format::FormatDesc;
use crate::iov::IovecSet;
use crate::resource::{Resource, Target};

/// A 3D box in texels. Signed so that negative guest values can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferBox {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
}

impl TransferBox {
    pub fn new(origin: [u32; 3], extent: [u32; 3]) -> Self {
        Self {
            x: origin[0] as i32,
            y: origin[1] as i32,
            z: origin[2] as i32,
            width: extent[0] as i32,
            height: extent[1] as i32,
            depth: extent[2] as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Guest memory into the resource.
    ToHost,
    /// Resource contents out to guest memory.
    FromHost,
}

impl TransferDirection {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(TransferDirection::ToHost),
            2 => Some(TransferDirection::FromHost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferInfo {
    pub handle: u32,
    pub ctx_id: u32,
    pub level: u32,
    pub area: TransferBox,
    /// Row pitch in guest memory, 0 for the level's natural pitch.
    pub stride: u32,
    pub layer_stride: u32,
    pub offset: u64,
    /// Look the resource up in the global table instead of the context's
    /// attachments.
    pub context0: bool,
    pub synchronized: bool,
}

/// Row and layer pitch after defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    pub stride: u32,
    pub layer_stride: u32,
}

fn out_of_bounds(info: &TransferInfo, what: &str) -> RenderError {
    RenderError::invalid(format!(
        "transfer on resource {} level {}: {what}",
        info.handle, info.level
    ))
}

fn check_axis(info: &TransferInfo, start: i32, len: i32, limit: i32, axis: &str) -> Result<()> {
    if start < 0 || len < 0 || len > limit || start > limit || start + len > limit {
        return Err(out_of_bounds(info, &format!("{axis} range {start}+{len} exceeds {limit}")));
    }
    Ok(())
}

/// Checks the box against the minified dimensions of the addressed level.
pub fn check_bounds(res: &Resource, info: &TransferInfo) -> Result<()> {
    if info.level > res.last_level {
        return Err(out_of_bounds(info, "mip level out of range"));
    }
    let area = &info.area;
    check_axis(info, area.x, area.width, res.level_width(info.level) as i32, "x")?;
    check_axis(info, area.y, area.height, res.level_height(info.level) as i32, "y")?;
    let layers = res.level_layers(info.level) as i32;
    if res.target == Target::Texture3d {
        check_axis(info, area.z, area.depth, layers, "z")?;
    } else if area.z < 0
        || area.depth < 0
        || area.depth > layers
        || area.z > layers
        || area.z + area.depth > layers
    {
        return Err(out_of_bounds(info, "layer range exceeds array size"));
    }
    Ok(())
}

/// Bytes covered by a box laid out with the given pitches. The last row and
/// layer only count what they actually use.
pub fn transfer_size(format: &FormatDesc, area: &TransferBox, strides: Strides) -> u64 {
    let w = area.width.max(1) as u32;
    let h = area.height.max(1) as u32;
    let d = area.depth.max(1) as u64;
    (d - 1) * strides.layer_stride as u64
        + (format.blocks_y(h) as u64 - 1) * strides.stride as u64
        + format.blocks_x(w) as u64 * format.block_size as u64
}

/// Resolves the pitches of a transfer and checks that `iov_size` bytes from
/// the transfer offset can hold it.
pub fn check_iov_bounds(res: &Resource, info: &TransferInfo, iov_size: u64) -> Result<Strides> {
    let format = &res.format;
    let stride = if info.stride != 0 {
        let min = format.stride(info.area.width.max(0) as u32);
        if (info.stride as u64) < min {
            return Err(out_of_bounds(info, "stride smaller than a row"));
        }
        info.stride
    } else {
        format.stride(res.level_width(info.level)) as u32
    };
    let layer_stride = if info.layer_stride != 0 {
        let min = format.blocks_y(info.area.height.max(0) as u32) as u64 * stride as u64;
        if (info.layer_stride as u64) < min {
            return Err(out_of_bounds(info, "layer stride smaller than a layer"));
        }
        info.layer_stride
    } else {
        format.blocks_y(res.level_height(info.level)) * stride
    };

    let strides = Strides {
        stride,
        layer_stride,
    };
    let needed = transfer_size(format, &info.area, strides);
    if iov_size < info.offset || iov_size < needed || iov_size < info.offset + needed {
        return Err(out_of_bounds(
            info,
            &format!("{needed} bytes at offset {} exceed {iov_size}", info.offset),
        ));
    }
    Ok(strides)
}

/// Size of the box when tightly packed.
pub fn packed_size(format: &FormatDesc, area: &TransferBox) -> usize {
    let w = area.width.max(0) as u32;
    let h = area.height.max(0) as u32;
    let d = area.depth.max(1) as usize;
    format.blocks_x(w) as usize * format.blocks_y(h) as usize * format.block_size as usize * d
}

fn packed_row(format: &FormatDesc, area: &TransferBox) -> (usize, usize) {
    let row = format.blocks_x(area.width.max(0) as u32) as usize * format.block_size as usize;
    let rows = format.blocks_y(area.height.max(0) as u32) as usize;
    (row, rows)
}

/// Gathers the box out of guest memory into `out`, tightly packed.
///
/// With `invert` the rows of each layer are stored bottom-up in guest memory.
pub fn pack_from_iov(
    iov: &IovecSet,
    format: &FormatDesc,
    offset: u64,
    strides: Strides,
    area: &TransferBox,
    invert: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    let (row, rows) = packed_row(format, area);
    let depth = area.depth.max(1) as usize;
    out.clear();
    out.resize(row * rows * depth, 0);

    for d in 0..depth {
        let mut src = offset + d as u64 * strides.layer_stride as u64;
        for r in 0..rows {
            let dst_row = if invert { rows - 1 - r } else { r };
            let start = (d * rows + dst_row) * row;
            iov.read_exact(src as usize, &mut out[start..start + row])?;
            src += strides.stride as u64;
        }
    }
    Ok(())
}

/// Scatters a tightly packed box back into guest memory.
pub fn unpack_to_iov(
    iov: &IovecSet,
    format: &FormatDesc,
    offset: u64,
    strides: Strides,
    area: &TransferBox,
    invert: bool,
    data: &[u8],
) -> Result<()> {
    let (row, rows) = packed_row(format, area);
    let depth = area.depth.max(1) as usize;
    if data.len() < row * rows * depth {
        return Err(RenderError::Fault(format!(
            "packed data holds {} bytes, box needs {}",
            data.len(),
            row * rows * depth
        )));
    }

    for d in 0..depth {
        let mut dst = offset + d as u64 * strides.layer_stride as u64;
        for r in 0..rows {
            let src_row = if invert { rows - 1 - r } else { r };
            let start = (d * rows + src_row) * row;
            iov.write_exact(dst as usize, &data[start..start + row])?;
            dst += strides.stride as u64;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{describe, B8G8R8A8_UNORM};
    use crate::registry::ReleaseQueue;
    use crate::resource::{validate, BindFlags, ResourceCreateArgs, TextureLimits};

    fn texture(width: u32, height: u32, last_level: u32) -> Resource {
        let args = ResourceCreateArgs {
            handle: 3,
            target: 2,
            format: B8G8R8A8_UNORM,
            bind: BindFlags::SAMPLER_VIEW.bits(),
            width,
            height,
            depth: 1,
            array_size: 1,
            last_level,
            ..Default::default()
        };
        let (target, format) = validate(&args, &TextureLimits::default()).unwrap();
        Resource::new(&args, target, format, ReleaseQueue::default())
    }

    fn info(level: u32, area: TransferBox) -> TransferInfo {
        TransferInfo {
            handle: 3,
            level,
            area,
            ..Default::default()
        }
    }

    #[test]
    fn bounds_follow_minified_level() {
        let res = texture(16, 8, 2);
        let whole_level1 = TransferBox::new([0, 0, 0], [8, 4, 1]);
        assert!(check_bounds(&res, &info(1, whole_level1)).is_ok());
        let too_wide = TransferBox::new([1, 0, 0], [8, 4, 1]);
        assert!(check_bounds(&res, &info(1, too_wide)).is_err());
        assert!(check_bounds(&res, &info(3, whole_level1)).is_err());
        let negative = TransferBox {
            x: -1,
            width: 1,
            height: 1,
            depth: 1,
            ..Default::default()
        };
        assert!(check_bounds(&res, &info(0, negative)).is_err());
    }

    #[test]
    fn negative_layer_range_rejected_for_2d_targets() {
        let res = texture(16, 8, 0);
        let below = TransferBox {
            z: -1,
            width: 1,
            height: 1,
            depth: 1,
            ..Default::default()
        };
        assert!(check_bounds(&res, &info(0, below)).is_err());
        let shrunk = TransferBox {
            z: 1,
            width: 1,
            height: 1,
            depth: -1,
            ..Default::default()
        };
        assert!(check_bounds(&res, &info(0, shrunk)).is_err());
        let first_layer = TransferBox::new([0, 0, 0], [1, 1, 1]);
        assert!(check_bounds(&res, &info(0, first_layer)).is_ok());
    }

    #[test]
    fn default_strides_and_iov_size() {
        let res = texture(16, 8, 0);
        let area = TransferBox::new([0, 0, 0], [4, 2, 1]);
        let strides = check_iov_bounds(&res, &info(0, area), 16 * 4 * 8).unwrap();
        assert_eq!(strides.stride, 64);
        assert_eq!(strides.layer_stride, 512);
        // one full row plus the used part of the second
        assert_eq!(transfer_size(&res.format, &area, strides), 64 + 16);

        let mut shifted = info(0, area);
        shifted.offset = 16 * 4 * 8 - 60;
        assert!(check_iov_bounds(&res, &shifted, 16 * 4 * 8).is_err());

        let mut narrow = info(0, area);
        narrow.stride = 8;
        assert!(check_iov_bounds(&res, &narrow, 4096).is_err());
    }

    #[test]
    fn pack_honours_stride_and_inversion() {
        let format = describe(B8G8R8A8_UNORM).unwrap();
        let mut guest = vec![0u8; 32];
        guest[..4].copy_from_slice(&[1, 1, 1, 1]);
        guest[16..20].copy_from_slice(&[2, 2, 2, 2]);
        let iov = IovecSet::single(guest);
        let area = TransferBox::new([0, 0, 0], [1, 2, 1]);
        let strides = Strides {
            stride: 16,
            layer_stride: 32,
        };

        let mut packed = Vec::new();
        pack_from_iov(&iov, &format, 0, strides, &area, false, &mut packed).unwrap();
        assert_eq!(packed, vec![1, 1, 1, 1, 2, 2, 2, 2]);

        pack_from_iov(&iov, &format, 0, strides, &area, true, &mut packed).unwrap();
        assert_eq!(packed, vec![2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn unpack_writes_rows_at_stride() {
        let format = describe(B8G8R8A8_UNORM).unwrap();
        let iov = IovecSet::single(vec![0u8; 24]);
        let area = TransferBox::new([0, 0, 0], [1, 2, 1]);
        let strides = Strides {
            stride: 12,
            layer_stride: 24,
        };
        unpack_to_iov(&iov, &format, 4, strides, &area, false, &[5, 5, 5, 5, 6, 6, 6, 6]).unwrap();
        let mut out = [0u8; 24];
        iov.read(0, &mut out);
        assert_eq!(&out[4..8], &[5, 5, 5, 5]);
        assert_eq!(&out[16..20], &[6, 6, 6, 6]);
        assert!(out[8..16].iter().all(|b| *b == 0));
    }
}
