//! Elementwise kernels

use std::sync::OnceLock;

use super::{expect_len, saturate, KernelFault};

/// In-place q7 ReLU
pub fn relu(data: &mut [i8]) {
    for x in data {
        *x = (*x).max(0);
    }
}

/// Parameters of a q7 sigmoid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigmoidOpt {
    /// Integer bits of the input format, at most 3
    pub int_width: u16,
}

/// Sigmoid of every Q3.4 value, as Q0.7
fn sigmoid_table() -> &'static [i8; 256] {
    static TABLE: OnceLock<[i8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0i8; 256];
        for (idx, entry) in table.iter_mut().enumerate() {
            let x = f64::from(idx as u8 as i8) / 16.0;
            let y = (128.0 / (1.0 + (-x).exp())).round();
            *entry = saturate(y as i32);
        }
        table
    })
}

/// In-place q7 sigmoid by table look-up
///
/// Inputs are rescaled to the table's Q3.4 grid by dropping fractional bits;
/// outputs are Q0.7, so one saturates at 127.
///
/// # Errors
///
/// Returns `BadParams` for more than 3 integer bits.
pub fn sigmoid(data: &mut [i8], opt: &SigmoidOpt) -> Result<(), KernelFault> {
    if opt.int_width > 3 {
        return Err(KernelFault::BadParams(format!("sigmoid int_width {} above 3", opt.int_width)));
    }
    let shift = 3 - opt.int_width;
    let table = sigmoid_table();
    for x in data {
        *x = table[usize::from((*x >> shift) as u8)];
    }
    Ok(())
}

/// Parameters of a saturating q7 add
///
/// Each operand carries its own integer-bit count. The operand with more
/// integer bits is shifted left onto the finer grid before adding; the sum
/// is then shifted right by `out_rshift` and saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddOpt {
    /// Integer bits of the first operand
    pub int_bits1: u16,
    /// Integer bits of the second operand
    pub int_bits2: u16,
    /// Right shift applied to the sum
    pub out_rshift: u16,
    /// Elements per operand
    pub num_elem: u16,
}

/// Saturating q7 add
///
/// # Errors
///
/// Returns a fault for out-of-range bit counts or mismatched lengths.
pub fn add(a: &[i8], b: &[i8], opt: &AddOpt, out: &mut [i8]) -> Result<(), KernelFault> {
    if opt.int_bits1 > 7 || opt.int_bits2 > 7 || opt.out_rshift > 15 {
        return Err(KernelFault::BadParams(format!("{opt:?}")));
    }
    let n = usize::from(opt.num_elem);
    expect_len("first operand", a, n)?;
    expect_len("second operand", b, n)?;
    expect_len("output", out, n)?;

    let fine = opt.int_bits1.min(opt.int_bits2);
    let (sa, sb) = (opt.int_bits1 - fine, opt.int_bits2 - fine);
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        let sum = (i32::from(x) << sa) + (i32::from(y) << sb);
        *o = saturate(sum >> opt.out_rshift);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_clamps_negatives() {
        let mut v = [-3i8, 0, 4, -128, 127];
        relu(&mut v);
        assert_eq!(v, [0, 0, 4, 0, 127]);
    }

    #[test]
    fn sigmoid_is_centred_and_saturates() {
        let mut v = [0i8, 16, -16, 127, -128];
        sigmoid(&mut v, &SigmoidOpt { int_width: 3 }).unwrap();
        // 0.5, sigmoid(1) = 0.731, sigmoid(-1) = 0.269
        assert_eq!(v, [64, 94, 34, 127, 0]);
    }

    #[test]
    fn sigmoid_rescales_narrow_formats() {
        // 64 in Q0.7 and 8 in Q3.4 both mean 0.5
        let mut fine = [64i8];
        let mut coarse = [8i8];
        sigmoid(&mut fine, &SigmoidOpt { int_width: 0 }).unwrap();
        sigmoid(&mut coarse, &SigmoidOpt { int_width: 3 }).unwrap();
        assert_eq!(fine, coarse);
        assert!(sigmoid(&mut fine, &SigmoidOpt { int_width: 4 }).is_err());
    }

    #[test]
    fn add_aligns_formats() {
        let opt = AddOpt { int_bits1: 2, int_bits2: 0, out_rshift: 0, num_elem: 2 };
        let mut out = [0i8; 2];
        add(&[1, 10], &[1, 100], &opt, &mut out).unwrap();
        assert_eq!(out, [5, 127]);
    }

    #[test]
    fn add_rejects_length_mismatch() {
        let opt = AddOpt { num_elem: 3, ..AddOpt::default() };
        assert!(add(&[0; 3], &[0; 2], &opt, &mut [0; 3]).is_err());
    }
}
