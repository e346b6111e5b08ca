// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated SoC address space
//!
//! The executor only needs two things from memory: an allocator with the
//! `alloc(size, class) -> address | null` / `free(address, class)` contract,
//! and byte access by bus address so kernels can work on resolved addresses.
//! [`SystemMemory`] provides both over one pool per [`MemoryClass`], plus a
//! read-only window for firmware constants that buffers can be mapped onto.
//!
//! Pools are first-fit over a sorted block map. Every block is backed by its
//! own byte vector, so an access must stay inside one block; anything else is
//! an [`ExecError::Memory`] fault rather than a silent overrun into a
//! neighbour.

use std::collections::BTreeMap;
use std::fmt;

use hetex_chip::memmap::{self, MemoryClass, Window, ALIGN};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::error::{ExecError, Result};

/// A bus address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub u32);

impl Address {
    /// The null address
    pub const NULL: Self = Self(0);

    /// Whether this is the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    ///
    /// # Errors
    ///
    /// Returns a `Memory` fault if the result leaves the 32-bit space.
    pub fn offset(self, bytes: usize) -> Result<Self> {
        u32::try_from(bytes)
            .ok()
            .and_then(|b| self.0.checked_add(b))
            .map(Self)
            .ok_or(ExecError::Memory { address: self.0, len: bytes })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Allocator contract the executor consumes
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes in `class`; `None` when exhausted
    fn alloc(&self, size: usize, class: MemoryClass) -> Option<Address>;

    /// Return a block obtained from [`alloc`](Self::alloc)
    fn free(&self, addr: Address, class: MemoryClass);
}

/// Allocator plus byte access by bus address
pub trait MemorySystem: Allocator + fmt::Debug {
    /// Copy `len` bytes starting at `addr`
    ///
    /// # Errors
    ///
    /// Returns a `Memory` fault if the range is not inside one backed block.
    fn read(&self, addr: Address, len: usize) -> Result<Vec<u8>>;

    /// Store `data` starting at `addr`
    ///
    /// # Errors
    ///
    /// Returns a `Memory` fault if the range is not inside one writable block.
    fn write(&self, addr: Address, data: &[u8]) -> Result<()>;
}

const fn align_up(n: u32) -> u32 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

#[derive(Debug)]
struct Pool {
    window: Window,
    limit: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Pool {
    fn new(window: Window, bytes: u32) -> Self {
        Self {
            window,
            limit: window.base + bytes,
            blocks: BTreeMap::new(),
        }
    }

    fn place(&self, size: u32) -> Option<u32> {
        let mut cursor = self.window.base;
        for (&start, data) in &self.blocks {
            if start - cursor >= size {
                return Some(cursor);
            }
            cursor = align_up(start + data.len() as u32);
        }
        (self.limit.saturating_sub(cursor) >= size).then_some(cursor)
    }

    fn alloc(&mut self, size: usize) -> Option<u32> {
        let size = u32::try_from(size.max(1)).ok()?.checked_add(ALIGN - 1)? & !(ALIGN - 1);
        let at = self.place(size)?;
        self.blocks.insert(at, vec![0u8; size as usize]);
        Some(at)
    }

    fn block(&self, addr: u32, len: usize) -> Option<(&Vec<u8>, usize)> {
        let (&start, data) = self.blocks.range(..=addr).next_back()?;
        let off = (addr - start) as usize;
        (off + len <= data.len()).then_some((data, off))
    }

    fn block_mut(&mut self, addr: u32, len: usize) -> Option<(&mut Vec<u8>, usize)> {
        let (&start, data) = self.blocks.range_mut(..=addr).next_back()?;
        let off = (addr - start) as usize;
        (off + len <= data.len()).then_some((data, off))
    }

    fn in_use(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }
}

/// Simulated address space with one pool per memory class
#[derive(Debug)]
pub struct SystemMemory {
    pools: [Mutex<Pool>; 3],
    rom: Mutex<Pool>,
}

impl SystemMemory {
    /// Create pools sized by `config`
    pub fn new(config: MemoryConfig) -> Self {
        let pool =
            |class: MemoryClass| Mutex::new(Pool::new(class.window(), config.pool_bytes(class)));
        Self {
            pools: [
                pool(MemoryClass::ControlLocal),
                pool(MemoryClass::CoprocessorLocal),
                pool(MemoryClass::Shared),
            ],
            rom: Mutex::new(Pool::new(memmap::ROM, memmap::ROM.size)),
        }
    }

    /// Place read-only firmware constants and return their address
    ///
    /// Buffers are attached to the region with a mapped allocation
    /// (`base = Some(addr)`); the executor never frees it.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the constant window is full.
    pub fn map_rom(&self, data: &[u8]) -> Result<Address> {
        let mut rom = self.rom.lock();
        let at = rom
            .alloc(data.len())
            .ok_or_else(|| {
                let requested = data.len();
                ExecError::out_of_memory(format!("ROM window full ({requested} bytes requested)"))
            })?;
        if let Some((block, _)) = rom.block_mut(at, data.len()) {
            block[..data.len()].copy_from_slice(data);
        }
        debug!(address = %Address(at), len = data.len(), "Mapped constant region");
        Ok(Address(at))
    }

    /// Bytes currently allocated in `class`
    pub fn bytes_in_use(&self, class: MemoryClass) -> usize {
        self.pools[class.index()].lock().in_use()
    }

    /// Blocks currently allocated in `class`
    pub fn live_blocks(&self, class: MemoryClass) -> usize {
        self.pools[class.index()].lock().blocks.len()
    }

    fn pool_for(&self, addr: u32) -> &Mutex<Pool> {
        match memmap::class_of(addr) {
            Some(class) => &self.pools[class.index()],
            None => &self.rom,
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl Allocator for SystemMemory {
    fn alloc(&self, size: usize, class: MemoryClass) -> Option<Address> {
        let addr = self.pools[class.index()].lock().alloc(size).map(Address);
        if addr.is_none() {
            debug!(size, ?class, "Pool exhausted");
        }
        addr
    }

    fn free(&self, addr: Address, class: MemoryClass) {
        if self.pools[class.index()].lock().blocks.remove(&addr.0).is_none() {
            warn!(%addr, ?class, "Free of an address that is not a live block");
        }
    }
}

impl MemorySystem for SystemMemory {
    fn read(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let pool = self.pool_for(addr.0).lock();
        let (block, off) = pool
            .block(addr.0, len)
            .ok_or(ExecError::Memory { address: addr.0, len })?;
        Ok(block[off..off + len].to_vec())
    }

    fn write(&self, addr: Address, data: &[u8]) -> Result<()> {
        if memmap::class_of(addr.0).is_none() {
            return Err(ExecError::Memory { address: addr.0, len: data.len() });
        }
        let mut pool = self.pool_for(addr.0).lock();
        let (block, off) = pool
            .block_mut(addr.0, data.len())
            .ok_or(ExecError::Memory { address: addr.0, len: data.len() })?;
        block[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}
