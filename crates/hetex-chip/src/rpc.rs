//! Cross-core RPC wire layout.
//!
//! The control core hands work to the co-processor by writing a
//! [`RemoteMessage`] into shared memory and posting `(module, op, address)`
//! through the mailbox. The co-processor reads the message, runs the kernel,
//! writes a status word back into the message and raises a response that
//! identifies the request it answers.
//!
//! ## Message layout
//!
//! Little-endian 16-bit words; the co-processor has no wider loads on the
//! shared bus.
//!
//! ```text
//! word  0        status        STATUS_PENDING until the co-processor answers
//! words 1..6     input         ShmemBuf
//! words 6..11    output        ShmemBuf
//! words 11..16   weight        ShmemBuf
//! words 16..21   bias          ShmemBuf
//! word  21       sequence      request sequence number, echoed in the response
//! words 22..42   params        operator parameters, see [`param`]
//! ```

use crate::limits::MAX_TRANSFER_LEN;

/// Mailbox module tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleTag(pub u8);

/// Module tag owned by the executor.
pub const MODULE_EXECUTOR: ModuleTag = ModuleTag(3);

// ── Operators ────────────────────────────────────────────────────────────────

/// Operators the co-processor firmware implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RemoteOp {
    /// Standard 2-D convolution.
    Conv2d = 0x01,
    /// Depthwise 2-D convolution.
    DepthwiseConv2d = 0x02,
    /// Average pooling.
    AvgPool2d = 0x03,
    /// Max pooling.
    MaxPool2d = 0x04,
    /// In-place ReLU.
    Relu = 0x05,
    /// Channel-planar convolution, ReLU and 2×2 average pooling in one pass.
    ConvReluAvgPool = 0x06,
}

impl RemoteOp {
    /// Mailbox op tag.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Decode a mailbox op tag.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Conv2d),
            0x02 => Some(Self::DepthwiseConv2d),
            0x03 => Some(Self::AvgPool2d),
            0x04 => Some(Self::MaxPool2d),
            0x05 => Some(Self::Relu),
            0x06 => Some(Self::ConvReluAvgPool),
            _ => None,
        }
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Written by the control core before posting.
pub const STATUS_PENDING: u16 = 0xFFFF;
/// Kernel completed.
pub const STATUS_OK: u16 = 0;
/// Parameter words inconsistent with the operand sizes.
pub const STATUS_BAD_PARAMS: u16 = 1;
/// An operand address is outside readable memory.
pub const STATUS_BAD_ADDRESS: u16 = 2;
/// Op tag not implemented by the firmware.
pub const STATUS_UNKNOWN_OP: u16 = 3;

// ── Parameter words ──────────────────────────────────────────────────────────

/// Number of parameter words carried by a message.
pub const PARAM_WORDS: usize = 20;

/// Parameter word indices for windowed operators (convolution, pooling).
///
/// `act_min`/`act_max` carry `i16` values bit-cast to `u16`. The fused
/// convolution + pooling operator uses the input, filter, shift and clamp
/// words; `FILT_ROWS` holds its square kernel size.
pub mod param {
    /// Input rows.
    pub const IN_ROWS: usize = 0;
    /// Input columns.
    pub const IN_COLS: usize = 1;
    /// Input channels.
    pub const IN_DEPTH: usize = 2;
    /// Filters in this request (standard conv) or depth multiplier (depthwise).
    pub const NUM_FILT: usize = 3;
    /// Kernel rows.
    pub const FILT_ROWS: usize = 4;
    /// Kernel columns.
    pub const FILT_COLS: usize = 5;
    /// Vertical stride.
    pub const ROW_STRIDE: usize = 6;
    /// Horizontal stride.
    pub const COL_STRIDE: usize = 7;
    /// Implicit zero rows above the input.
    pub const PAD_TOP: usize = 8;
    /// Implicit zero columns left of the input.
    pub const PAD_LEFT: usize = 9;
    /// Output rows.
    pub const OUT_ROWS: usize = 10;
    /// Output columns.
    pub const OUT_COLS: usize = 11;
    /// Bias left shift (conv) or output left shift (pool).
    pub const LSHIFT: usize = 12;
    /// Output right shift.
    pub const RSHIFT: usize = 13;
    /// Activation lower clamp.
    pub const ACT_MIN: usize = 14;
    /// Activation upper clamp.
    pub const ACT_MAX: usize = 15;
    /// Operand layout, [`LAYOUT_HWC`] or [`LAYOUT_CHW`].
    pub const LAYOUT: usize = 16;

    /// Caller buffers in interleaved row-major layout.
    pub const LAYOUT_HWC: u16 = 0;
    /// Channel-planar layout used by streamed patches.
    pub const LAYOUT_CHW: u16 = 1;

    /// Element count, low half (elementwise operators).
    pub const COUNT_LO: usize = 0;
    /// Element count, high half (elementwise operators).
    pub const COUNT_HI: usize = 1;
}

// ── Buffer records ───────────────────────────────────────────────────────────

/// One operand as the co-processor sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmemBuf {
    /// Non-zero when the operand lives in shared memory.
    pub mapped: u16,
    /// Offset into the shared window when `mapped`.
    pub offset: u16,
    /// Byte length, see [`encode_len`].
    pub size: u16,
    /// Upper half of the bus address.
    pub addr_hi: u16,
    /// Lower half of the bus address.
    pub addr_lo: u16,
}

impl ShmemBuf {
    /// Words occupied in the message.
    pub const WORDS: usize = 5;

    /// Full bus address.
    pub const fn address(&self) -> u32 {
        ((self.addr_hi as u32) << 16) | self.addr_lo as u32
    }

    /// Whether the record describes no operand.
    pub const fn is_empty(&self) -> bool {
        self.addr_hi == 0 && self.addr_lo == 0
    }

    fn write_words(&self, out: &mut [u16]) {
        out.copy_from_slice(&[self.mapped, self.offset, self.size, self.addr_hi, self.addr_lo]);
    }

    fn read_words(w: &[u16]) -> Self {
        Self { mapped: w[0], offset: w[1], size: w[2], addr_hi: w[3], addr_lo: w[4] }
    }
}

/// Split a bus address into `(hi, lo)` halves.
pub const fn split_address(addr: u32) -> (u16, u16) {
    ((addr >> 16) as u16, (addr & 0xFFFF) as u16)
}

/// Encode a byte length into the 16-bit size field.
///
/// `65536` is sent as `65535`; longer lengths return `None`.
pub fn encode_len(len: usize) -> Option<u16> {
    match len {
        MAX_TRANSFER_LEN => Some(u16::MAX),
        n => u16::try_from(n).ok(),
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// Shared-memory mirror of one remote invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    /// Completion status, written by the co-processor.
    pub status: u16,
    /// Activation input.
    pub input: ShmemBuf,
    /// Output.
    pub output: ShmemBuf,
    /// Weights, empty for operators without any.
    pub weight: ShmemBuf,
    /// Bias, empty for operators without any.
    pub bias: ShmemBuf,
    /// Request sequence number, echoed in the response.
    pub sequence: u16,
    /// Operator parameters.
    pub params: [u16; PARAM_WORDS],
}

impl Default for RemoteMessage {
    fn default() -> Self {
        Self {
            status: STATUS_PENDING,
            input: ShmemBuf::default(),
            output: ShmemBuf::default(),
            weight: ShmemBuf::default(),
            bias: ShmemBuf::default(),
            sequence: 0,
            params: [0; PARAM_WORDS],
        }
    }
}

impl RemoteMessage {
    /// Message size in 16-bit words.
    pub const WORDS: usize = 2 + 4 * ShmemBuf::WORDS + PARAM_WORDS;
    /// Message size in bytes.
    pub const BYTES: usize = Self::WORDS * 2;
    /// Byte offset of the status word.
    pub const STATUS_OFFSET: usize = 0;

    /// Serialise to the little-endian wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut words = [0u16; Self::WORDS];
        words[0] = self.status;
        let bufs = [&self.input, &self.output, &self.weight, &self.bias];
        for (i, buf) in bufs.into_iter().enumerate() {
            let at = 1 + i * ShmemBuf::WORDS;
            buf.write_words(&mut words[at..at + ShmemBuf::WORDS]);
        }
        words[21] = self.sequence;
        words[22..].copy_from_slice(&self.params);
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Parse the wire form. Returns `None` if `bytes` is too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::BYTES {
            return None;
        }
        let words: Vec<u16> = bytes[..Self::BYTES]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let buf = |i: usize| {
            let at = 1 + i * ShmemBuf::WORDS;
            ShmemBuf::read_words(&words[at..at + ShmemBuf::WORDS])
        };
        let mut params = [0u16; PARAM_WORDS];
        params.copy_from_slice(&words[22..]);
        Some(Self {
            status: words[0],
            input: buf(0),
            output: buf(1),
            weight: buf(2),
            bias: buf(3),
            sequence: words[21],
            params,
        })
    }
}
