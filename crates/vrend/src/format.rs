//! Pixel format table keyed by the guest's numeric format ids.
//!
//! Only the properties the transfer and state code needs are kept: block
//! geometry for stride math, alpha presence for blend patching and the
//! depth/stencil split for clears and surfaces.

use serde::Serialize;

/// One past the highest format id a guest may name.
pub const FORMAT_MAX: u32 = 313;

pub const B8G8R8A8_UNORM: u32 = 1;
pub const B8G8R8X8_UNORM: u32 = 2;
pub const A8R8G8B8_UNORM: u32 = 3;
pub const X8R8G8B8_UNORM: u32 = 4;
pub const B5G5R5A1_UNORM: u32 = 5;
pub const B4G4R4A4_UNORM: u32 = 6;
pub const B5G6R5_UNORM: u32 = 7;
pub const R10G10B10A2_UNORM: u32 = 8;
pub const L8_UNORM: u32 = 9;
pub const A8_UNORM: u32 = 10;
pub const I8_UNORM: u32 = 11;
pub const L8A8_UNORM: u32 = 12;
pub const L16_UNORM: u32 = 13;
pub const Z16_UNORM: u32 = 16;
pub const Z32_UNORM: u32 = 17;
pub const Z32_FLOAT: u32 = 18;
pub const Z24_UNORM_S8_UINT: u32 = 19;
pub const S8_UINT_Z24_UNORM: u32 = 20;
pub const Z24X8_UNORM: u32 = 21;
pub const X8Z24_UNORM: u32 = 22;
pub const S8_UINT: u32 = 23;
pub const R32_FLOAT: u32 = 28;
pub const R32G32_FLOAT: u32 = 29;
pub const R32G32B32_FLOAT: u32 = 30;
pub const R32G32B32A32_FLOAT: u32 = 31;
pub const R16_UNORM: u32 = 48;
pub const R16G16_UNORM: u32 = 49;
pub const R16G16B16A16_UNORM: u32 = 51;
pub const R8_UNORM: u32 = 64;
pub const R8G8_UNORM: u32 = 65;
pub const R8G8B8_UNORM: u32 = 66;
pub const R8G8B8A8_UNORM: u32 = 67;
pub const X8B8G8R8_UNORM: u32 = 68;
pub const R8G8B8A8_SNORM: u32 = 77;
pub const R16_FLOAT: u32 = 91;
pub const R16G16_FLOAT: u32 = 92;
pub const R16G16B16_FLOAT: u32 = 93;
pub const R16G16B16A16_FLOAT: u32 = 94;
pub const B8G8R8A8_SRGB: u32 = 100;
pub const B8G8R8X8_SRGB: u32 = 101;
pub const R8G8B8A8_SRGB: u32 = 104;
pub const DXT1_RGB: u32 = 105;
pub const DXT1_RGBA: u32 = 106;
pub const DXT3_RGBA: u32 = 107;
pub const DXT5_RGBA: u32 = 108;
pub const DXT1_SRGB: u32 = 109;
pub const DXT1_SRGBA: u32 = 110;
pub const DXT3_SRGBA: u32 = 111;
pub const DXT5_SRGBA: u32 = 112;
pub const RGTC1_UNORM: u32 = 113;
pub const RGTC1_SNORM: u32 = 114;
pub const RGTC2_UNORM: u32 = 115;
pub const RGTC2_SNORM: u32 = 116;
pub const A8B8G8R8_UNORM: u32 = 121;
pub const B5G5R5X1_UNORM: u32 = 122;
pub const R11G11B10_FLOAT: u32 = 124;
pub const R9G9B9E5_FLOAT: u32 = 125;
pub const Z32_FLOAT_S8X24_UINT: u32 = 126;
pub const B10G10R10A2_UNORM: u32 = 131;
pub const R8G8B8X8_UNORM: u32 = 134;
pub const R8_UINT: u32 = 177;
pub const R8G8_UINT: u32 = 178;
pub const R8G8B8A8_UINT: u32 = 180;
pub const R8_SINT: u32 = 181;
pub const R8G8B8A8_SINT: u32 = 184;
pub const R16_UINT: u32 = 185;
pub const R16G16_UINT: u32 = 186;
pub const R16G16B16A16_UINT: u32 = 188;
pub const R16_SINT: u32 = 189;
pub const R16G16B16A16_SINT: u32 = 192;
pub const R32_UINT: u32 = 193;
pub const R32G32_UINT: u32 = 194;
pub const R32G32B32_UINT: u32 = 195;
pub const R32G32B32A32_UINT: u32 = 196;
pub const R32_SINT: u32 = 197;
pub const R32G32_SINT: u32 = 198;
pub const R32G32B32A32_SINT: u32 = 200;
pub const B10G10R10A2_UINT: u32 = 225;
pub const R8G8B8X8_SRGB: u32 = 230;
pub const R10G10B10A2_UINT: u32 = 253;
pub const BPTC_RGBA_UNORM: u32 = 255;
pub const BPTC_SRGBA: u32 = 256;
pub const BPTC_RGB_FLOAT: u32 = 257;
pub const BPTC_RGB_UFLOAT: u32 = 258;
pub const R8_SRGB: u32 = 312;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Color,
    Depth,
    Stencil,
    DepthStencil,
    Compressed,
}

/// Block layout and classification for one format id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatDesc {
    pub id: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub block_size: u32,
    pub kind: FormatKind,
    pub has_alpha: bool,
    pub srgb: bool,
}

impl FormatDesc {
    const fn color(id: u32, block_size: u32, has_alpha: bool) -> Self {
        Self {
            id,
            block_width: 1,
            block_height: 1,
            block_size,
            kind: FormatKind::Color,
            has_alpha,
            srgb: false,
        }
    }

    const fn srgb(id: u32, block_size: u32, has_alpha: bool) -> Self {
        let mut desc = Self::color(id, block_size, has_alpha);
        desc.srgb = true;
        desc
    }

    const fn zs(id: u32, block_size: u32, kind: FormatKind) -> Self {
        Self {
            id,
            block_width: 1,
            block_height: 1,
            block_size,
            kind,
            has_alpha: false,
            srgb: false,
        }
    }

    const fn compressed(id: u32, block_size: u32, has_alpha: bool, srgb: bool) -> Self {
        Self {
            id,
            block_width: 4,
            block_height: 4,
            block_size,
            kind: FormatKind::Compressed,
            has_alpha,
            srgb,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self.kind, FormatKind::Depth | FormatKind::DepthStencil)
    }

    pub fn is_stencil(&self) -> bool {
        matches!(self.kind, FormatKind::Stencil | FormatKind::DepthStencil)
    }

    pub fn is_compressed(&self) -> bool {
        self.kind == FormatKind::Compressed
    }

    /// Number of blocks covering `pixels` texels horizontally.
    pub fn blocks_x(&self, pixels: u32) -> u32 {
        pixels.div_ceil(self.block_width)
    }

    pub fn blocks_y(&self, pixels: u32) -> u32 {
        pixels.div_ceil(self.block_height)
    }

    /// Tightly packed row pitch for `width` texels.
    pub fn stride(&self, width: u32) -> u64 {
        u64::from(self.blocks_x(width)) * u64::from(self.block_size)
    }
}

/// Looks up a format id, returning `None` for ids the renderer cannot use.
pub fn describe(format: u32) -> Option<FormatDesc> {
    use FormatKind::*;

    let desc = match format {
        B8G8R8A8_UNORM | A8R8G8B8_UNORM | R8G8B8A8_UNORM | A8B8G8R8_UNORM | R8G8B8A8_SNORM
        | R8G8B8A8_UINT | R8G8B8A8_SINT | R10G10B10A2_UNORM | B10G10R10A2_UNORM
        | B10G10R10A2_UINT | R10G10B10A2_UINT => FormatDesc::color(format, 4, true),
        B8G8R8X8_UNORM | X8R8G8B8_UNORM | X8B8G8R8_UNORM | R8G8B8X8_UNORM | R11G11B10_FLOAT
        | R9G9B9E5_FLOAT => FormatDesc::color(format, 4, false),
        B5G5R5A1_UNORM | B4G4R4A4_UNORM | L8A8_UNORM => FormatDesc::color(format, 2, true),
        B5G6R5_UNORM | B5G5R5X1_UNORM | L16_UNORM | R16_UNORM | R16_FLOAT | R8G8_UNORM
        | R8G8_UINT | R16_UINT | R16_SINT => FormatDesc::color(format, 2, false),
        A8_UNORM => FormatDesc::color(format, 1, true),
        L8_UNORM | I8_UNORM | R8_UNORM | R8_UINT | R8_SINT => FormatDesc::color(format, 1, false),
        R8G8B8_UNORM => FormatDesc::color(format, 3, false),
        R16G16_UNORM | R16G16_FLOAT | R16G16_UINT | R32_FLOAT | R32_UINT | R32_SINT => {
            FormatDesc::color(format, 4, false)
        }
        R16G16B16_FLOAT => FormatDesc::color(format, 6, false),
        R16G16B16A16_UNORM | R16G16B16A16_FLOAT | R16G16B16A16_UINT | R16G16B16A16_SINT => {
            FormatDesc::color(format, 8, true)
        }
        R32G32_FLOAT | R32G32_UINT | R32G32_SINT => FormatDesc::color(format, 8, false),
        R32G32B32_FLOAT | R32G32B32_UINT => FormatDesc::color(format, 12, false),
        R32G32B32A32_FLOAT | R32G32B32A32_UINT | R32G32B32A32_SINT => {
            FormatDesc::color(format, 16, true)
        }
        B8G8R8A8_SRGB | R8G8B8A8_SRGB => FormatDesc::srgb(format, 4, true),
        B8G8R8X8_SRGB | R8G8B8X8_SRGB => FormatDesc::srgb(format, 4, false),
        R8_SRGB => FormatDesc::srgb(format, 1, false),
        Z16_UNORM => FormatDesc::zs(format, 2, Depth),
        Z32_UNORM | Z32_FLOAT | Z24X8_UNORM | X8Z24_UNORM => FormatDesc::zs(format, 4, Depth),
        Z24_UNORM_S8_UINT | S8_UINT_Z24_UNORM => FormatDesc::zs(format, 4, DepthStencil),
        Z32_FLOAT_S8X24_UINT => FormatDesc::zs(format, 8, DepthStencil),
        S8_UINT => FormatDesc::zs(format, 1, Stencil),
        DXT1_RGB | RGTC1_UNORM | RGTC1_SNORM => FormatDesc::compressed(format, 8, false, false),
        DXT1_RGBA => FormatDesc::compressed(format, 8, true, false),
        DXT1_SRGB => FormatDesc::compressed(format, 8, false, true),
        DXT1_SRGBA => FormatDesc::compressed(format, 8, true, true),
        DXT3_RGBA | DXT5_RGBA | BPTC_RGBA_UNORM => FormatDesc::compressed(format, 16, true, false),
        DXT3_SRGBA | DXT5_SRGBA | BPTC_SRGBA => FormatDesc::compressed(format, 16, true, true),
        RGTC2_UNORM | RGTC2_SNORM | BPTC_RGB_FLOAT | BPTC_RGB_UFLOAT => {
            FormatDesc::compressed(format, 16, false, false)
        }
        _ => return None,
    };
    Some(desc)
}

/// Iterates every format id the table knows about.
pub fn known_formats() -> impl Iterator<Item = FormatDesc> {
    (0..FORMAT_MAX).filter_map(describe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_blocks_round_up() {
        let dxt1 = describe(DXT1_RGB).unwrap();
        assert_eq!(dxt1.blocks_x(5), 2);
        assert_eq!(dxt1.stride(5), 16);
        let dxt5 = describe(DXT5_RGBA).unwrap();
        assert_eq!(dxt5.stride(16), 64);
    }

    #[test]
    fn classifies_depth_and_alpha() {
        let zs = describe(Z24_UNORM_S8_UINT).unwrap();
        assert!(zs.is_depth() && zs.is_stencil());
        assert!(!describe(B8G8R8X8_UNORM).unwrap().has_alpha);
        assert!(describe(B8G8R8A8_UNORM).unwrap().has_alpha);
        assert!(describe(0).is_none());
        assert!(describe(FORMAT_MAX).is_none());
    }

    #[test]
    fn table_has_no_duplicate_ids() {
        let ids: Vec<u32> = known_formats().map(|desc| desc.id).collect();
        let mut sorted = ids.clone();
        sorted.dedup();
        assert_eq!(ids, sorted);
        assert!(ids.len() > 60);
    }
}
