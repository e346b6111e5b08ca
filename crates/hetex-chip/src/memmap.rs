//! Memory classes and their address windows.
//!
//! ```text
//! 0x0800_0000  ROM        1 MiB    firmware constants (weights, tables), mapped only
//! 0x1000_0000  CONTROL  256 KiB    control-core SRAM
//! 0x2000_0000  COPROC    64 KiB    co-processor data memory
//! 0x3000_0000  SHARED    64 KiB    shared SRAM, 16-bit offset addressable from the DSP
//! ```
//!
//! Address 0 is never part of any window and stands for "no memory".

/// Memory class a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Control-core local SRAM.
    ControlLocal,
    /// Co-processor local data memory.
    CoprocessorLocal,
    /// Memory visible to both cores.
    Shared,
}

impl MemoryClass {
    /// All allocatable classes.
    pub const ALL: [Self; 3] = [Self::ControlLocal, Self::CoprocessorLocal, Self::Shared];

    /// Address window backing this class.
    pub const fn window(self) -> Window {
        match self {
            Self::ControlLocal => CONTROL,
            Self::CoprocessorLocal => COPROC,
            Self::Shared => SHARED,
        }
    }

    /// Pool index for per-class tables.
    pub const fn index(self) -> usize {
        match self {
            Self::ControlLocal => 0,
            Self::CoprocessorLocal => 1,
            Self::Shared => 2,
        }
    }
}

/// A contiguous address window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// First address in the window.
    pub base: u32,
    /// Window size in bytes.
    pub size: u32,
}

impl Window {
    /// One past the last address.
    pub const fn end(self) -> u32 {
        self.base + self.size
    }

    /// Whether `addr` falls inside the window.
    pub const fn contains(self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Read-only firmware constant region.
pub const ROM: Window = Window { base: 0x0800_0000, size: 1 << 20 };
/// Control-core SRAM.
pub const CONTROL: Window = Window { base: 0x1000_0000, size: 256 * 1024 };
/// Co-processor data memory.
pub const COPROC: Window = Window { base: 0x2000_0000, size: 64 * 1024 };
/// Shared SRAM.
pub const SHARED: Window = Window { base: 0x3000_0000, size: 64 * 1024 };

/// Allocation granularity of every pool.
pub const ALIGN: u32 = 4;

/// Memory class owning `addr`, if it lies in an allocatable window.
pub fn class_of(addr: u32) -> Option<MemoryClass> {
    MemoryClass::ALL.into_iter().find(|c| c.window().contains(addr))
}
