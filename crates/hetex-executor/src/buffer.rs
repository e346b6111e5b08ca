// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer descriptors and their lifecycle records
//!
//! A [`Buffer`] is a cheap, clonable handle to one memory-region descriptor.
//! The descriptor's attributes ([`BufferSpec`]) are fixed at creation; its
//! lifecycle record (residency, role, usage count, pending-free flag) is
//! created when the buffer is allocated or mapped and dropped again when it
//! is destroyed.
//!
//! ```text
//!            allocate / map                attach (admission)
//! Unbacked ─────────────────▶ Active{addr} ◀──────────────────┐
//!    ▲                           │                             │
//!    │ destroy                   │ retire, usage reaches 0     │
//!    │                           ▼                             │
//!    └──────────────────────  Idle{addr} ──────────────────────┘
//! ```
//!
//! All record mutations happen while the scheduling table lock is held; the
//! per-buffer mutex only makes the record shareable with readers such as
//! [`Buffer::address`]. Lock order is table, then record, then memory pool.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hetex_chip::memmap::MemoryClass;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ExecError, Result};
use crate::memory::{Address, Allocator};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Where a buffer's memory comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Peripheral or I/O mapped memory
    Peripheral,
    /// Allocated by the executor from a pool
    Local,
    /// Internal persistent storage (firmware constants)
    InternalPersistent,
    /// External persistent storage
    ExternalPersistent,
}

impl Origin {
    /// Persistent buffers are always mapped, never allocated
    pub const fn is_persistent(self) -> bool {
        matches!(self, Self::InternalPersistent | Self::ExternalPersistent)
    }
}

/// Access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// May only be read by kernels
    ReadOnly,
    /// May be read and written
    ReadWrite,
}

/// How long a buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Destroyed when the last work item using it retires
    PerOperation,
    /// Survives retirement until explicitly freed
    Global,
}

/// Element width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSize {
    /// 8-bit
    One,
    /// 16-bit
    Two,
    /// 24-bit
    Three,
    /// 32-bit
    Four,
}

impl ElementSize {
    /// Width in bytes
    pub const fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }
}

/// Role a buffer currently plays in the scheduling table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not attached to any work item
    None,
    /// Read by a scheduled item
    Input,
    /// Written by a scheduled item
    Output,
    /// Read and written in place by one scheduled item
    InputOutput,
}

/// Residency state, observable from outside the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No backing memory, no lifecycle record
    Unbacked,
    /// Backed and referenced by (or freshly prepared for) scheduled work
    Active,
    /// Backed, contents kept, no scheduled work references it
    Idle,
}

/// Immutable descriptor attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Memory origin
    pub origin: Origin,
    /// Access mode
    pub access: Access,
    /// Memory class for allocation
    pub class: MemoryClass,
    /// Element width
    pub element_size: ElementSize,
    /// Lifetime scope
    pub scope: Scope,
    /// Number of elements
    pub elements: usize,
}

impl BufferSpec {
    /// Global, read-write, locally allocated bytes in control-core memory
    pub const fn new(elements: usize) -> Self {
        Self {
            origin: Origin::Local,
            access: Access::ReadWrite,
            class: MemoryClass::ControlLocal,
            element_size: ElementSize::One,
            scope: Scope::Global,
            elements,
        }
    }

    /// Set the origin
    pub const fn origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Set the memory class
    pub const fn class(mut self, class: MemoryClass) -> Self {
        self.class = class;
        self
    }

    /// Set the element width
    pub const fn element_size(mut self, size: ElementSize) -> Self {
        self.element_size = size;
        self
    }

    /// Mark as per-operation scratch
    pub const fn per_operation(mut self) -> Self {
        self.scope = Scope::PerOperation;
        self
    }

    /// Mark as read-only
    pub const fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    /// Size in bytes
    pub const fn byte_len(&self) -> usize {
        self.elements * self.element_size.bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Active { addr: Address },
    Idle { addr: Address },
}

impl Residency {
    const fn addr(self) -> Address {
        match self {
            Self::Active { addr } | Self::Idle { addr } => addr,
        }
    }
}

#[derive(Debug)]
struct LifecycleRecord {
    residency: Residency,
    role: Role,
    usage: u32,
    pending_free: bool,
    /// Backing memory came from the allocator and goes back to it
    owned: bool,
}

/// Outcome of a retirement or free request for one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Still referenced, or an in-place alias handled by the output side
    Kept,
    /// Now idle, contents retained
    Idled,
    /// Deferred until the last reference retires
    Deferred,
    /// Record dropped, owned memory returned
    Destroyed,
}

struct BufferInner {
    id: u64,
    spec: BufferSpec,
    record: Mutex<Option<LifecycleRecord>>,
}

/// Handle to a buffer descriptor
///
/// Clones refer to the same descriptor; identity is the descriptor, not the
/// address it resolves to.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.inner.record.lock();
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("spec", &self.inner.spec)
            .field("record", &*record)
            .finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Buffer {}

impl Buffer {
    /// Create an unbacked descriptor
    pub fn new(spec: BufferSpec) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                spec,
                record: Mutex::new(None),
            }),
        }
    }

    /// Descriptor id, unique for the process
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Descriptor attributes
    pub fn spec(&self) -> &BufferSpec {
        &self.inner.spec
    }

    /// Size in bytes
    pub fn byte_len(&self) -> usize {
        self.inner.spec.byte_len()
    }

    /// Resolved address
    ///
    /// # Errors
    ///
    /// Returns `NotBacked` if the buffer has no lifecycle record.
    pub fn address(&self) -> Result<Address> {
        self.inner
            .record
            .lock()
            .as_ref()
            .map(|r| r.residency.addr())
            .ok_or(ExecError::NotBacked { buffer: self.id() })
    }

    /// Current residency state
    pub fn state(&self) -> BufferState {
        match self.inner.record.lock().as_ref().map(|r| r.residency) {
            None => BufferState::Unbacked,
            Some(Residency::Active { .. }) => BufferState::Active,
            Some(Residency::Idle { .. }) => BufferState::Idle,
        }
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.inner.record.lock().as_ref().map_or(Role::None, |r| r.role)
    }

    /// Number of scheduled work items referencing this buffer
    pub fn usage_count(&self) -> u32 {
        self.inner.record.lock().as_ref().map_or(0, |r| r.usage)
    }

    /// Whether a free has been requested and deferred
    pub fn is_pending_free(&self) -> bool {
        self.inner.record.lock().as_ref().is_some_and(|r| r.pending_free)
    }

    // ── Lifecycle transitions ────────────────────────────────────────────────

    /// Back the descriptor with memory
    ///
    /// With `base`, resolves `base + offset * element_size` and does not own
    /// the memory. Without, allocates `byte_len` bytes from the pool for the
    /// descriptor's class.
    pub(crate) fn allocate(
        &self,
        mem: &dyn Allocator,
        base: Option<Address>,
        offset: usize,
    ) -> Result<Address> {
        let spec = self.inner.spec;
        let mut record = self.inner.record.lock();
        if record.is_some() {
            return Err(ExecError::AlreadyBacked { buffer: self.id() });
        }
        let (addr, owned) = match base {
            Some(base) if !base.is_null() => {
                (base.offset(offset * spec.element_size.bytes())?, false)
            }
            _ if spec.origin.is_persistent() => {
                return Err(ExecError::out_of_memory(format!(
                    "persistent buffer {} has no base to map onto",
                    self.id()
                )));
            }
            _ => {
                let addr = mem.alloc(spec.byte_len(), spec.class).ok_or_else(|| {
                    ExecError::out_of_memory(format!(
                        "{} bytes in {:?} for buffer {}",
                        spec.byte_len(),
                        spec.class,
                        self.id()
                    ))
                })?;
                (addr, true)
            }
        };
        *record = Some(LifecycleRecord {
            residency: Residency::Active { addr },
            role: Role::None,
            usage: 0,
            pending_free: false,
            owned,
        });
        debug!(buffer = self.id(), %addr, owned, "Buffer backed");
        Ok(addr)
    }

    /// Re-point a backed descriptor at new memory without reallocating
    pub(crate) fn remap(
        &self,
        mem: &dyn Allocator,
        base: Address,
        offset: usize,
    ) -> Result<Address> {
        let spec = self.inner.spec;
        let mut guard = self.inner.record.lock();
        let record = guard
            .as_mut()
            .ok_or_else(|| {
                ExecError::invalid_remap(format!("buffer {} has no lifecycle record", self.id()))
            })?;
        if base.is_null() {
            return Err(ExecError::invalid_remap("null base address"));
        }
        if record.usage > 0 {
            return Err(ExecError::invalid_remap(format!(
                "buffer {} is referenced by {} scheduled item(s)",
                self.id(),
                record.usage
            )));
        }
        let addr = base.offset(offset * spec.element_size.bytes())?;
        if record.owned {
            mem.free(record.residency.addr(), spec.class);
        }
        *record = LifecycleRecord {
            residency: Residency::Active { addr },
            role: Role::None,
            usage: 0,
            pending_free: false,
            owned: false,
        };
        Ok(addr)
    }

    /// Attach to a work item being admitted
    pub(crate) fn attach(&self, role: Role) -> Result<()> {
        let mut guard = self.inner.record.lock();
        let record = guard.as_mut().ok_or(ExecError::NotBacked { buffer: self.id() })?;
        record.residency = Residency::Active { addr: record.residency.addr() };
        record.role = role;
        record.usage += 1;
        Ok(())
    }

    /// Detach one input reference of a retiring work item
    pub(crate) fn release_input(&self, mem: &dyn Allocator) -> Release {
        let mut guard = self.inner.record.lock();
        let Some(record) = guard.as_mut() else {
            return Release::Kept;
        };
        record.usage = record.usage.saturating_sub(1);
        if record.role != Role::Input || record.usage > 0 {
            return Release::Kept;
        }
        match self.inner.spec.scope {
            Scope::Global if !record.pending_free => {
                record.residency = Residency::Idle { addr: record.residency.addr() };
                record.role = Role::None;
                Release::Idled
            }
            _ => self.destroy(&mut guard, mem),
        }
    }

    /// Detach the output reference of a retiring work item
    ///
    /// Outputs are never destroyed speculatively: only a pending free
    /// with no remaining references does that.
    pub(crate) fn release_output(&self, mem: &dyn Allocator) -> Release {
        let mut guard = self.inner.record.lock();
        let Some(record) = guard.as_mut() else {
            return Release::Kept;
        };
        record.usage = record.usage.saturating_sub(1);
        if record.usage > 0 {
            return Release::Kept;
        }
        record.residency = Residency::Idle { addr: record.residency.addr() };
        record.role = Role::None;
        if record.pending_free {
            self.destroy(&mut guard, mem)
        } else {
            Release::Idled
        }
    }

    /// Free now if unreferenced, otherwise defer to the last retirement
    pub(crate) fn request_free(&self, mem: &dyn Allocator) -> Release {
        let mut guard = self.inner.record.lock();
        let Some(record) = guard.as_mut() else {
            return Release::Kept;
        };
        if record.usage > 0 {
            record.pending_free = true;
            debug!(buffer = self.id(), usage = record.usage, "Free deferred");
            return Release::Deferred;
        }
        self.destroy(&mut guard, mem)
    }

    fn destroy(&self, record: &mut Option<LifecycleRecord>, mem: &dyn Allocator) -> Release {
        if let Some(r) = record.take() {
            if r.owned {
                mem.free(r.residency.addr(), self.inner.spec.class);
            }
            debug!(buffer = self.id(), owned = r.owned, "Buffer destroyed");
        }
        Release::Destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySystem, SystemMemory};

    #[test]
    fn allocate_sets_active_with_zero_usage() {
        let mem = SystemMemory::default();
        let buf = Buffer::new(BufferSpec::new(16));
        assert_eq!(buf.state(), BufferState::Unbacked);
        let addr = buf.allocate(&mem, None, 0).unwrap();
        assert_eq!(buf.address().unwrap(), addr);
        assert_eq!(buf.state(), BufferState::Active);
        assert_eq!(buf.usage_count(), 0);
        assert!(matches!(buf.allocate(&mem, None, 0), Err(ExecError::AlreadyBacked { .. })));
    }

    #[test]
    fn mapped_address_scales_offset_by_element_size() {
        let mem = SystemMemory::default();
        let buf = Buffer::new(BufferSpec::new(4).element_size(ElementSize::Four));
        let addr = buf.allocate(&mem, Some(Address(0x1000_0100)), 3).unwrap();
        assert_eq!(addr, Address(0x1000_010C));
    }

    #[test]
    fn persistent_without_base_is_out_of_memory() {
        let mem = SystemMemory::default();
        let buf = Buffer::new(BufferSpec::new(4).origin(Origin::InternalPersistent));
        assert!(matches!(buf.allocate(&mem, None, 0), Err(ExecError::OutOfMemory { .. })));
        assert_eq!(buf.state(), BufferState::Unbacked);
    }

    #[test]
    fn remap_rules() {
        let mem = SystemMemory::default();
        let buf = Buffer::new(BufferSpec::new(8));
        assert!(matches!(
            buf.remap(&mem, Address(0x1000_0000), 0),
            Err(ExecError::InvalidRemap { .. })
        ));

        buf.allocate(&mem, None, 0).unwrap();
        assert!(matches!(buf.remap(&mem, Address::NULL, 0), Err(ExecError::InvalidRemap { .. })));

        let rom = mem.map_rom(&[0; 8]).unwrap();
        assert_eq!(buf.remap(&mem, rom, 0).unwrap(), rom);
        assert_eq!(mem.live_blocks(MemoryClass::ControlLocal), 0);
    }

    #[test]
    fn request_free_defers_while_referenced() {
        let mem = SystemMemory::default();
        let buf = Buffer::new(BufferSpec::new(8));
        buf.allocate(&mem, None, 0).unwrap();
        buf.attach(Role::Output).unwrap();
        assert_eq!(buf.request_free(&mem), Release::Deferred);
        assert!(buf.is_pending_free());
        assert_eq!(buf.release_output(&mem), Release::Destroyed);
        assert_eq!(buf.state(), BufferState::Unbacked);
        assert_eq!(mem.live_blocks(MemoryClass::ControlLocal), 0);
    }

    #[test]
    fn global_input_goes_idle_per_op_input_is_destroyed() {
        let mem = SystemMemory::default();
        let global = Buffer::new(BufferSpec::new(8));
        let scratch = Buffer::new(BufferSpec::new(8).per_operation());
        global.allocate(&mem, None, 0).unwrap();
        scratch.allocate(&mem, None, 0).unwrap();
        global.attach(Role::Input).unwrap();
        scratch.attach(Role::Input).unwrap();

        assert_eq!(global.release_input(&mem), Release::Idled);
        assert_eq!(global.state(), BufferState::Idle);
        assert!(global.address().is_ok());

        assert_eq!(scratch.release_input(&mem), Release::Destroyed);
        assert!(matches!(scratch.address(), Err(ExecError::NotBacked { .. })));
    }

    #[test]
    fn in_place_alias_is_left_to_output_side() {
        let mem = SystemMemory::default();
        let buf = Buffer::new(BufferSpec::new(8).per_operation());
        buf.allocate(&mem, None, 0).unwrap();
        buf.attach(Role::InputOutput).unwrap();
        buf.attach(Role::InputOutput).unwrap();
        assert_eq!(buf.release_input(&mem), Release::Kept);
        assert_eq!(buf.release_output(&mem), Release::Idled);
        assert_eq!(buf.usage_count(), 0);
    }

    #[test]
    fn persistent_free_keeps_memory() {
        let mem = SystemMemory::default();
        let rom = mem.map_rom(&[1, 2, 3, 4]).unwrap();
        let buf = Buffer::new(BufferSpec::new(4).origin(Origin::ExternalPersistent).read_only());
        buf.allocate(&mem, Some(rom), 0).unwrap();
        assert_eq!(buf.request_free(&mem), Release::Destroyed);
        assert_eq!(mem.read(rom, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}
