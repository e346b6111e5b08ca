//! Heterogeneous operator executor for a dual-core SoC.
//!
//! Accepts a stream of tensor-operator invocations, tracks data
//! dependencies between operators that share buffers, serialises the ones
//! that conflict, and runs each either on the control core or on the DSP
//! co-processor behind a shared-memory RPC bridge.
//!
//! # Architecture
//!
//! ```text
//!  caller threads
//!       │ conv2d / relu / submit ...
//!       ▼
//!  ┌──────────┐  admit (hazard stall)  ┌──────────────────┐
//!  │ Executor │───────────────────────▶│ SchedulingTable  │◀── retire ──┐
//!  └──────────┘                        └──────────────────┘             │
//!       │ queue WorkId                                                  │
//!       ├──────────────▶ control lane ──▶ worker ──▶ local kernel ──────┤
//!       └──────────────▶ coproc lane  ──▶ worker ──▶ Bridge ──▶ Transport
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hetex_executor::{BufferSpec, Executor, ExecutorConfig, SoftwareCoprocessor, SystemMemory};
//! use hetex_chip::units::ExecutionUnit;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let memory = Arc::new(SystemMemory::default());
//! let dsp = Arc::new(SoftwareCoprocessor::start(memory.clone())?);
//! let exec = Executor::new(ExecutorConfig::from_env()?, memory, dsp)?;
//!
//! let data = exec.create_buffer(BufferSpec::new(64))?;
//! exec.write_buffer(&data, &[0x80; 64])?;
//! exec.relu(ExecutionUnit::Coprocessor, &data)?;
//! exec.wait_all()?;
//! assert!(exec.read_buffer(&data)?.iter().all(|&b| b == 0));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`buffer`] | Descriptors and lifecycle records |
//! | [`scheduler`] | Work items, scheduling table, hazard detector |
//! | [`ops`] | Operator registration table and reference kernels |
//! | [`bridge`] | Remote invocation and oversized-operand streaming |
//! | [`coprocessor`] | Thread-backed software co-processor |
//! | [`memory`] | Allocator contract and simulated address space |
//! | [`kernels`], [`layout`] | q7 kernels and layout transforms |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod coprocessor;
mod dispatch;
mod error;
mod executor;
pub mod kernels;
pub mod layout;
pub mod memory;
pub mod ops;
pub mod scheduler;
pub mod trace;

pub use buffer::{Access, Buffer, BufferSpec, BufferState, ElementSize, Origin, Role, Scope};
pub use config::{CoprocessorBudget, ExecutorConfig, KernelFailurePolicy, MemoryConfig};
pub use coprocessor::SoftwareCoprocessor;
pub use error::{ExecError, Result};
pub use executor::Executor;
pub use memory::{Address, Allocator, MemorySystem, SystemMemory};
pub use ops::{KernelContext, OpParams, Operand, OperatorEntry, OperatorId, OperatorTable, Variant};
pub use scheduler::{SlotState, WorkId, WorkItem};
pub use trace::{TraceEvent, TraceKind, TraceLog};
