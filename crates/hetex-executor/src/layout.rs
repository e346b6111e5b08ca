//! Tensor layout transforms
//!
//! Pure reshuffles between the interleaved `HWC` order callers use and the
//! channel-planar `CHW` order the co-processor computes in, plus the weight
//! reorders that go with them. No arithmetic happens here.

/// Whole tensor `HWC → CHW`
pub fn hwc_to_chw(src: &[i8], rows: usize, cols: usize, depth: usize) -> Vec<i8> {
    let mut dst = vec![0i8; rows * cols * depth];
    for r in 0..rows {
        for c in 0..cols {
            for ch in 0..depth {
                dst[(ch * rows + r) * cols + c] = src[(r * cols + c) * depth + ch];
            }
        }
    }
    dst
}

/// Whole tensor `CHW → HWC`
pub fn chw_to_hwc(src: &[i8], rows: usize, cols: usize, depth: usize) -> Vec<i8> {
    let mut dst = vec![0i8; rows * cols * depth];
    scatter_chw_into_hwc(src, rows, cols, depth, &mut dst, depth, 0);
    dst
}

/// Scatter a `CHW` block of `channels` planes into an `HWC` tensor of
/// `dst_depth` channels, starting at channel `first_channel`
///
/// Used to reassemble a filter group's output into the full-depth result.
pub fn scatter_chw_into_hwc(
    src: &[i8],
    rows: usize,
    cols: usize,
    channels: usize,
    dst: &mut [i8],
    dst_depth: usize,
    first_channel: usize,
) {
    for ch in 0..channels {
        let plane = &src[ch * rows * cols..(ch + 1) * rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                dst[(r * cols + c) * dst_depth + first_channel + ch] = plane[r * cols + c];
            }
        }
    }
}

/// Standard convolution weights `[f][kh][kw][cin] → [f][cin][kh][kw]`
pub fn reorder_conv_weights(
    src: &[i8],
    filters: usize,
    kh: usize,
    kw: usize,
    cin: usize,
) -> Vec<i8> {
    let mut dst = vec![0i8; filters * kh * kw * cin];
    for f in 0..filters {
        for i in 0..kh {
            for j in 0..kw {
                for ch in 0..cin {
                    let hwc = ((f * kh + i) * kw + j) * cin + ch;
                    dst[((f * cin + ch) * kh + i) * kw + j] = src[hwc];
                }
            }
        }
    }
    dst
}

/// Depthwise weights `[kh][kw][o] → [o][kh][kw]`
pub fn reorder_depthwise_weights(src: &[i8], kh: usize, kw: usize, outputs: usize) -> Vec<i8> {
    let mut dst = vec![0i8; kh * kw * outputs];
    for i in 0..kh {
        for j in 0..kw {
            for o in 0..outputs {
                dst[(o * kh + i) * kw + j] = src[(i * kw + j) * outputs + o];
            }
        }
    }
    dst
}
