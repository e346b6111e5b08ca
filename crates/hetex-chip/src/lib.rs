//! Silicon model for the dual-core inference SoC.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the parts of the chip the executor has to agree on with the
//! co-processor firmware: which execution units exist, where each memory class
//! lives in the address space, how much co-processor memory an operator may
//! occupy, and the byte layout of the cross-core RPC message.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`units`] | Execution units (control core, DSP co-processor) |
//! | [`memmap`] | Memory classes and their address windows |
//! | [`limits`] | Executor build limits and co-processor memory budgets |
//! | [`rpc`] | RPC module/op tags, `ShmemBuf`, `RemoteMessage` wire layout |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod limits;
pub mod memmap;
pub mod rpc;
pub mod units;
