//! WGSL conversion programs and their shared parameter block.
//!
//! Both programs treat the imported dma-bufs as raw `array<u32>` storage
//! and do their own byte packing, so arbitrary strides and plane offsets
//! work without any texture format negotiation.
//!
//! Color transform: **full-range BT.601**, fixed for both directions.
//! Mid-gray YUV (128, 128, 128) maps to RGB (128, 128, 128) exactly.
//!
//! ```text
//! R = Y + 1.402 (V - 128)
//! G = Y - 0.344136 (U - 128) - 0.714136 (V - 128)
//! B = Y + 1.772 (U - 128)
//!
//! Y = 0.299 R + 0.587 G + 0.114 B
//! U = 128 - 0.168736 R - 0.331264 G + 0.5 B
//! V = 128 + 0.5 R - 0.418688 G - 0.081312 B
//! ```

/// Per-dispatch parameters, shared by both programs.
///
/// `yuv_stride` is the NV12 row stride in pixels (= bytes); `rgb_stride`
/// is the RGB row stride in pixels (4 bytes each). `chroma_offset` is the
/// byte offset of the UV plane inside the NV12 buffer. `total_words` is
/// the dispatch bound for the word-parallel RGB -> NV12 program and unused
/// by the other direction.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConvertParams {
    pub width: u32,
    pub height: u32,
    pub yuv_stride: u32,
    pub rgb_stride: u32,
    pub chroma_offset: u32,
    pub total_words: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

/// Luma thread tile for the NV12 -> RGB program.
pub const WORKGROUP_DIM: u32 = 16;
/// Word-parallel workgroup width for the RGB -> NV12 program.
pub const WORKGROUP_WORDS: u32 = 256;

/// One thread per output pixel. Each RGB pixel is a whole 32-bit word, so
/// threads never share a destination word.
pub const SHADER_NV12_TO_RGB8: &str = r#"
struct Params {
    width: u32,
    height: u32,
    yuv_stride: u32,
    rgb_stride: u32,
    chroma_offset: u32,
    total_words: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> src: array<u32>;
@group(0) @binding(2) var<storage, read_write> dst: array<u32>;

fn src_byte(i: u32) -> f32 {
    let word = src[i / 4u];
    return f32((word >> ((i % 4u) * 8u)) & 0xffu);
}

// Full-range BT.601, 0..255 domain.
fn yuv_to_rgb(y: f32, u: f32, v: f32) -> vec3<f32> {
    let uc = u - 128.0;
    let vc = v - 128.0;
    let r = y + 1.402 * vc;
    let g = y - 0.344136 * uc - 0.714136 * vc;
    let b = y + 1.772 * uc;
    return clamp(vec3<f32>(r, g, b), vec3<f32>(0.0), vec3<f32>(255.0));
}

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let x = gid.x;
    let y = gid.y;
    if x >= params.width || y >= params.height {
        return;
    }

    let luma = src_byte(y * params.yuv_stride + x);
    let uv = params.chroma_offset + (y / 2u) * params.yuv_stride + (x / 2u) * 2u;
    let rgb = round(yuv_to_rgb(luma, src_byte(uv), src_byte(uv + 1u)));

    let r = u32(rgb.x);
    let g = u32(rgb.y);
    let b = u32(rgb.z);
    dst[y * params.rgb_stride + x] = r | (g << 8u) | (b << 16u) | (255u << 24u);
}
"#;

/// One thread per output *word* of the NV12 buffer. A word belongs to
/// exactly one thread, which derives each of its four bytes (luma sample,
/// or U/V of a 2x2 block average) from the RGB source, so the packed
/// writes need no atomics. Stride padding bytes replicate the clamped
/// edge pixel.
pub const SHADER_RGB8_TO_NV12: &str = r#"
struct Params {
    width: u32,
    height: u32,
    yuv_stride: u32,
    rgb_stride: u32,
    chroma_offset: u32,
    total_words: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> src: array<u32>;
@group(0) @binding(2) var<storage, read_write> dst: array<u32>;

fn pixel_rgb(x: u32, y: u32) -> vec3<f32> {
    let px = min(x, params.width - 1u);
    let py = min(y, params.height - 1u);
    let word = src[py * params.rgb_stride + px];
    return vec3<f32>(
        f32(word & 0xffu),
        f32((word >> 8u) & 0xffu),
        f32((word >> 16u) & 0xffu),
    );
}

fn luma_at(x: u32, y: u32) -> u32 {
    let rgb = pixel_rgb(x, y);
    let luma = 0.299 * rgb.x + 0.587 * rgb.y + 0.114 * rgb.z;
    return u32(clamp(round(luma), 0.0, 255.0));
}

// U or V for the 2x2 block whose top-left luma sample is (2*bx, 2*by).
fn chroma_at(bx: u32, by: u32, select_v: bool) -> u32 {
    let x = bx * 2u;
    let y = by * 2u;
    let rgb = (pixel_rgb(x, y) + pixel_rgb(x + 1u, y)
        + pixel_rgb(x, y + 1u) + pixel_rgb(x + 1u, y + 1u)) / 4.0;
    var c: f32;
    if select_v {
        c = 128.0 + 0.5 * rgb.x - 0.418688 * rgb.y - 0.081312 * rgb.z;
    } else {
        c = 128.0 - 0.168736 * rgb.x - 0.331264 * rgb.y + 0.5 * rgb.z;
    }
    return u32(clamp(round(c), 0.0, 255.0));
}

fn nv12_byte(b: u32) -> u32 {
    if b < params.chroma_offset {
        let row = b / params.yuv_stride;
        let col = b % params.yuv_stride;
        return luma_at(col, row);
    }
    let cb = b - params.chroma_offset;
    let row = cb / params.yuv_stride;
    let col = cb % params.yuv_stride;
    return chroma_at(col / 2u, row, (col & 1u) == 1u);
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let w = gid.x;
    if w >= params.total_words {
        return;
    }
    var word = 0u;
    for (var i = 0u; i < 4u; i = i + 1u) {
        word = word | (nv12_byte(w * 4u + i) << (i * 8u));
    }
    dst[w] = word;
}
"#;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn validate_wgsl(source: &str) {
        let module = naga::front::wgsl::parse_str(source).expect("WGSL parse failed");
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        )
        .validate(&module)
        .expect("WGSL validation failed");
    }

    #[test]
    fn nv12_to_rgb8_shader_is_valid() {
        validate_wgsl(SHADER_NV12_TO_RGB8);
    }

    #[test]
    fn rgb8_to_nv12_shader_is_valid() {
        validate_wgsl(SHADER_RGB8_TO_NV12);
    }

    #[test]
    fn params_block_matches_wgsl_layout() {
        // Eight u32 fields, no implicit padding.
        assert_eq!(std::mem::size_of::<ConvertParams>(), 32);
        let params = ConvertParams {
            width: 1,
            height: 2,
            yuv_stride: 3,
            rgb_stride: 4,
            chroma_offset: 5,
            total_words: 6,
            _pad0: 0,
            _pad1: 0,
        };
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &6u32.to_le_bytes());
    }
}
