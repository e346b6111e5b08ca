//! Marshalling between executor types and [`RemoteMessage`] words

use hetex_chip::memmap::SHARED;
use hetex_chip::rpc::{encode_len, param, split_address, RemoteOp, ShmemBuf, PARAM_WORDS};

use crate::error::{ExecError, Result};
use crate::kernels::{
    ConvKind, ConvReluPoolOpt, KernelFault, Layout, PoolKind, Requant, Window, WindowOp,
};
use crate::ops::Operand;

/// Describe an operand for the co-processor
///
/// # Errors
///
/// Returns `RemoteDispatchFailed` if the length does not fit the 16-bit
/// size field.
pub fn describe(operand: Operand) -> Result<ShmemBuf> {
    let size = encode_len(operand.len).ok_or_else(|| {
        ExecError::remote_dispatch_failed(format!(
            "{} byte operand at {} exceeds a single transfer",
            operand.len, operand.addr
        ))
    })?;
    let (addr_hi, addr_lo) = split_address(operand.addr.0);
    let (mapped, offset) = if SHARED.contains(operand.addr.0) {
        (1, (operand.addr.0 - SHARED.base) as u16)
    } else {
        (0, 0)
    };
    Ok(ShmemBuf { mapped, offset, size, addr_hi, addr_lo })
}

fn word(v: usize) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

/// Parameter words for a windowed operator
pub fn encode_window(win: &Window, op: &WindowOp, layout: Layout) -> [u16; PARAM_WORDS] {
    let mut p = [0u16; PARAM_WORDS];
    p[param::IN_ROWS] = word(win.in_rows);
    p[param::IN_COLS] = word(win.in_cols);
    p[param::IN_DEPTH] = word(win.in_depth);
    p[param::FILT_ROWS] = word(win.filt_rows);
    p[param::FILT_COLS] = word(win.filt_cols);
    p[param::ROW_STRIDE] = word(win.row_stride);
    p[param::COL_STRIDE] = word(win.col_stride);
    p[param::PAD_TOP] = word(win.pad_top);
    p[param::PAD_LEFT] = word(win.pad_left);
    p[param::OUT_ROWS] = word(win.out_rows);
    p[param::OUT_COLS] = word(win.out_cols);
    p[param::LAYOUT] = match layout {
        Layout::Hwc => param::LAYOUT_HWC,
        Layout::Chw => param::LAYOUT_CHW,
    };
    let (lshift, rshift, act_min, act_max) = match *op {
        WindowOp::Conv { kind, requant } => {
            p[param::NUM_FILT] = word(match kind {
                ConvKind::Standard { filters } => filters,
                ConvKind::Depthwise { multiplier } => multiplier,
            });
            (requant.bias_lshift, requant.out_rshift, requant.act_min, requant.act_max)
        }
        WindowOp::Pool { out_lshift, act_min, act_max, .. } => (out_lshift, 0, act_min, act_max),
    };
    p[param::LSHIFT] = lshift;
    p[param::RSHIFT] = rshift;
    p[param::ACT_MIN] = act_min as u16;
    p[param::ACT_MAX] = act_max as u16;
    p
}

/// Inverse of [`encode_window`] for the given op tag
///
/// # Errors
///
/// Returns `BadParams` for a non-windowed op or an unknown layout.
pub fn decode_window(
    op: RemoteOp,
    p: &[u16; PARAM_WORDS],
) -> std::result::Result<(Window, WindowOp, Layout), KernelFault> {
    let n = |i: usize| usize::from(p[i]);
    let win = Window {
        in_rows: n(param::IN_ROWS),
        in_cols: n(param::IN_COLS),
        in_depth: n(param::IN_DEPTH),
        filt_rows: n(param::FILT_ROWS),
        filt_cols: n(param::FILT_COLS),
        row_stride: n(param::ROW_STRIDE),
        col_stride: n(param::COL_STRIDE),
        pad_top: n(param::PAD_TOP),
        pad_left: n(param::PAD_LEFT),
        out_rows: n(param::OUT_ROWS),
        out_cols: n(param::OUT_COLS),
    };
    let layout = match p[param::LAYOUT] {
        param::LAYOUT_HWC => Layout::Hwc,
        param::LAYOUT_CHW => Layout::Chw,
        other => return Err(KernelFault::BadParams(format!("layout word {other}"))),
    };
    let requant = Requant {
        bias_lshift: p[param::LSHIFT],
        out_rshift: p[param::RSHIFT],
        act_min: p[param::ACT_MIN] as i16,
        act_max: p[param::ACT_MAX] as i16,
    };
    let pool = |kind| WindowOp::Pool {
        kind,
        out_lshift: p[param::LSHIFT],
        act_min: requant.act_min,
        act_max: requant.act_max,
    };
    let wop = match op {
        RemoteOp::Conv2d => WindowOp::Conv {
            kind: ConvKind::Standard { filters: n(param::NUM_FILT) },
            requant,
        },
        RemoteOp::DepthwiseConv2d => WindowOp::Conv {
            kind: ConvKind::Depthwise { multiplier: n(param::NUM_FILT) },
            requant,
        },
        RemoteOp::AvgPool2d => pool(PoolKind::Average),
        RemoteOp::MaxPool2d => pool(PoolKind::Max),
        RemoteOp::Relu | RemoteOp::ConvReluAvgPool => {
            return Err(KernelFault::BadParams(format!("{op:?} carries no single window")));
        }
    };
    Ok((win, wop, layout))
}

/// Parameter words for the fused convolution + ReLU + pooling operator
pub fn encode_fused(opt: &ConvReluPoolOpt) -> [u16; PARAM_WORDS] {
    let mut p = [0u16; PARAM_WORDS];
    p[param::IN_ROWS] = opt.in_rows;
    p[param::IN_COLS] = opt.in_cols;
    p[param::IN_DEPTH] = opt.in_depth;
    p[param::NUM_FILT] = opt.num_filt;
    p[param::FILT_ROWS] = opt.kernel;
    p[param::FILT_COLS] = opt.kernel;
    p[param::LSHIFT] = opt.bias_lshift;
    p[param::RSHIFT] = opt.out_rshift;
    p[param::ACT_MIN] = opt.act_min as u16;
    p[param::ACT_MAX] = opt.act_max as u16;
    p[param::LAYOUT] = param::LAYOUT_CHW;
    p
}

/// Inverse of [`encode_fused`]
///
/// # Errors
///
/// Returns `BadParams` for a non-square kernel or a layout other than CHW.
pub fn decode_fused(p: &[u16; PARAM_WORDS]) -> std::result::Result<ConvReluPoolOpt, KernelFault> {
    if p[param::FILT_ROWS] != p[param::FILT_COLS] || p[param::LAYOUT] != param::LAYOUT_CHW {
        return Err(KernelFault::BadParams("fused operator is square and channel-planar".into()));
    }
    Ok(ConvReluPoolOpt {
        in_rows: p[param::IN_ROWS],
        in_cols: p[param::IN_COLS],
        in_depth: p[param::IN_DEPTH],
        num_filt: p[param::NUM_FILT],
        kernel: p[param::FILT_ROWS],
        bias_lshift: p[param::LSHIFT],
        out_rshift: p[param::RSHIFT],
        act_min: p[param::ACT_MIN] as i16,
        act_max: p[param::ACT_MAX] as i16,
    })
}

/// Parameter words for an elementwise operator over `count` elements
pub fn encode_count(count: usize) -> [u16; PARAM_WORDS] {
    let mut p = [0u16; PARAM_WORDS];
    p[param::COUNT_LO] = (count & 0xFFFF) as u16;
    p[param::COUNT_HI] = ((count >> 16) & 0xFFFF) as u16;
    p
}

/// Inverse of [`encode_count`]
pub fn decode_count(p: &[u16; PARAM_WORDS]) -> usize {
    usize::from(p[param::COUNT_LO]) | (usize::from(p[param::COUNT_HI]) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Address;

    #[test]
    fn window_words_survive_decode() {
        let win = Window {
            in_rows: 5,
            in_cols: 7,
            in_depth: 3,
            filt_rows: 3,
            filt_cols: 3,
            row_stride: 1,
            col_stride: 2,
            pad_top: 1,
            pad_left: 0,
            out_rows: 5,
            out_cols: 3,
        };
        let op = WindowOp::Conv {
            kind: ConvKind::Standard { filters: 4 },
            requant: Requant { bias_lshift: 2, out_rshift: 5, act_min: -20, act_max: 90 },
        };
        let words = encode_window(&win, &op, Layout::Chw);
        assert_eq!(decode_window(RemoteOp::Conv2d, &words), Ok((win, op, Layout::Chw)));
        assert!(decode_window(RemoteOp::Relu, &words).is_err());
    }

    #[test]
    fn shared_operands_are_marked_mapped() {
        let shared = describe(Operand { addr: Address(SHARED.base + 0x40), len: 10 }).unwrap();
        assert_eq!((shared.mapped, shared.offset, shared.size), (1, 0x40, 10));
        let local = describe(Operand { addr: Address(0x1000_0000), len: 65_536 }).unwrap();
        assert_eq!((local.mapped, local.size), (0, u16::MAX));
        assert!(describe(Operand { addr: Address(0x1000_0000), len: 65_537 }).is_err());
    }

    #[test]
    fn fused_words_survive_decode() {
        let opt = ConvReluPoolOpt {
            in_rows: 9,
            in_cols: 11,
            in_depth: 3,
            num_filt: 6,
            kernel: 3,
            bias_lshift: 1,
            out_rshift: 6,
            act_min: -100,
            act_max: 100,
        };
        let mut words = encode_fused(&opt);
        assert_eq!(decode_fused(&words), Ok(opt));
        assert!(decode_window(RemoteOp::ConvReluAvgPool, &words).is_err());
        words[param::LAYOUT] = param::LAYOUT_HWC;
        assert!(decode_fused(&words).is_err());
    }

    #[test]
    fn counts_split_across_words() {
        assert_eq!(decode_count(&encode_count(70_000)), 70_000);
    }
}
