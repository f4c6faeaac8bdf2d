use wgpu::TextureFormat as Tf;

use crate::format::*;

/// Native format for a virgl format id. `None` keeps the texture in host
/// memory.
pub(super) fn texture_format(format: u32, features: wgpu::Features) -> Option<Tf> {
    let bc = features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
    Some(match format {
        B8G8R8A8_UNORM | B8G8R8X8_UNORM => Tf::Bgra8Unorm,
        B8G8R8A8_SRGB | B8G8R8X8_SRGB => Tf::Bgra8UnormSrgb,
        R8G8B8A8_UNORM | R8G8B8X8_UNORM => Tf::Rgba8Unorm,
        R8G8B8A8_SRGB | R8G8B8X8_SRGB => Tf::Rgba8UnormSrgb,
        R8G8B8A8_SNORM => Tf::Rgba8Snorm,
        R8G8B8A8_UINT => Tf::Rgba8Uint,
        R8G8B8A8_SINT => Tf::Rgba8Sint,
        R10G10B10A2_UNORM => Tf::Rgb10a2Unorm,
        R10G10B10A2_UINT => Tf::Rgb10a2Uint,
        R11G11B10_FLOAT => Tf::Rg11b10Ufloat,
        R9G9B9E5_FLOAT => Tf::Rgb9e5Ufloat,
        R8_UNORM => Tf::R8Unorm,
        R8_UINT => Tf::R8Uint,
        R8_SINT => Tf::R8Sint,
        R8G8_UNORM => Tf::Rg8Unorm,
        R8G8_UINT => Tf::Rg8Uint,
        R16_FLOAT => Tf::R16Float,
        R16_UINT => Tf::R16Uint,
        R16_SINT => Tf::R16Sint,
        R16G16_FLOAT => Tf::Rg16Float,
        R16G16_UINT => Tf::Rg16Uint,
        R16G16B16A16_FLOAT => Tf::Rgba16Float,
        R16G16B16A16_UINT => Tf::Rgba16Uint,
        R16G16B16A16_SINT => Tf::Rgba16Sint,
        R32_FLOAT => Tf::R32Float,
        R32_UINT => Tf::R32Uint,
        R32_SINT => Tf::R32Sint,
        R32G32_FLOAT => Tf::Rg32Float,
        R32G32_UINT => Tf::Rg32Uint,
        R32G32_SINT => Tf::Rg32Sint,
        R32G32B32A32_FLOAT => Tf::Rgba32Float,
        R32G32B32A32_UINT => Tf::Rgba32Uint,
        R32G32B32A32_SINT => Tf::Rgba32Sint,
        Z16_UNORM => Tf::Depth16Unorm,
        DXT1_RGB | DXT1_RGBA if bc => Tf::Bc1RgbaUnorm,
        DXT1_SRGB | DXT1_SRGBA if bc => Tf::Bc1RgbaUnormSrgb,
        DXT3_RGBA if bc => Tf::Bc2RgbaUnorm,
        DXT3_SRGBA if bc => Tf::Bc2RgbaUnormSrgb,
        DXT5_RGBA if bc => Tf::Bc3RgbaUnorm,
        DXT5_SRGBA if bc => Tf::Bc3RgbaUnormSrgb,
        RGTC1_UNORM if bc => Tf::Bc4RUnorm,
        RGTC1_SNORM if bc => Tf::Bc4RSnorm,
        RGTC2_UNORM if bc => Tf::Bc5RgUnorm,
        RGTC2_SNORM if bc => Tf::Bc5RgSnorm,
        BPTC_RGBA_UNORM if bc => Tf::Bc7RgbaUnorm,
        BPTC_SRGBA if bc => Tf::Bc7RgbaUnormSrgb,
        BPTC_RGB_FLOAT if bc => Tf::Bc6hRgbFloat,
        BPTC_RGB_UFLOAT if bc => Tf::Bc6hRgbUfloat,
        _ => return None,
    })
}

pub(super) fn aspect(format: Tf) -> wgpu::TextureAspect {
    if format.is_depth_stencil_format() {
        wgpu::TextureAspect::DepthOnly
    } else {
        wgpu::TextureAspect::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_formats_need_the_feature() {
        assert_eq!(texture_format(DXT5_RGBA, wgpu::Features::empty()), None);
        assert_eq!(
            texture_format(DXT5_RGBA, wgpu::Features::TEXTURE_COMPRESSION_BC),
            Some(Tf::Bc3RgbaUnorm)
        );
    }

    #[test]
    fn padded_formats_share_storage() {
        let none = wgpu::Features::empty();
        assert_eq!(texture_format(B8G8R8X8_UNORM, none), texture_format(B8G8R8A8_UNORM, none));
        assert_eq!(texture_format(Z24_UNORM_S8_UINT, none), None);
        assert_eq!(aspect(Tf::Depth16Unorm), wgpu::TextureAspect::DepthOnly);
    }
}
