//! Co-processor transport contract
//!
//! The mailbox below the bridge: post `(module, op, message address)` and
//! get a callback when the co-processor has finished. The callback echoes the
//! op tag and message address together with the sequence number the
//! co-processor read from the message, so a late answer can be told apart
//! from the one a caller is waiting for. Interrupt credits and the mailbox
//! wire format stay behind this trait.

use std::fmt;
use std::sync::Arc;

use hetex_chip::rpc::ModuleTag;

use crate::error::Result;
use crate::memory::Address;

/// One completed request as reported by the co-processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Op tag of the request
    pub op: u8,
    /// Message address the request was posted with
    pub message: Address,
    /// Sequence word found in the message when it was served
    pub sequence: u16,
}

/// Callback raised for every response to `module`
pub type ResponseHandler = Arc<dyn Fn(ModuleTag, Response) + Send + Sync>;

/// Cross-core mailbox
pub trait Transport: Send + Sync + fmt::Debug {
    /// Post a request whose message lives at `message`
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox refuses the request.
    fn submit(&self, module: ModuleTag, op: u8, message: Address) -> Result<()>;

    /// Route responses for `module` to `handler`, replacing any previous one
    fn on_response(&self, module: ModuleTag, handler: ResponseHandler);
}
