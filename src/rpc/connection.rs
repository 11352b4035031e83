//! Per-node connection slot

use super::{RpcTarget, RpcTransport};
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lazily established channel to one node.
///
/// Owned by exactly one node descriptor. The target is replaced, never
/// mutated, when the node's address changes or the channel goes invalid.
#[derive(Default)]
pub struct NodeConnection {
    target: Option<Arc<dyn RpcTarget>>,
    pending_poll: Option<CancellationToken>,
}

impl NodeConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a live target for `address`, creating one if the slot is
    /// empty, invalid or bound to another address.
    pub fn ensure(&mut self, transport: &dyn RpcTransport, address: &str) -> Result<Arc<dyn RpcTarget>> {
        if let Some(target) = &self.target {
            if target.is_valid() && target.address() == address {
                return Ok(target.clone());
            }
            debug!(
                address,
                previous = target.address(),
                valid = target.is_valid(),
                "Replacing node connection"
            );
        }
        // A failed connect leaves the slot empty.
        self.target = None;
        let target = transport.connect(address)?;
        self.target = Some(target.clone());
        Ok(target)
    }

    /// Drop the cached target.
    pub fn reset(&mut self) {
        self.target = None;
    }

    pub fn is_established(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.is_valid())
    }

    /// Register a new in-flight poll, returning the token its task watches.
    pub fn begin_poll(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.pending_poll = Some(token.clone());
        token
    }

    /// Abort the in-flight poll, if any. Returns whether one was signalled.
    pub fn abort_pending_poll(&mut self) -> bool {
        match self.pending_poll.take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("address", &self.target.as_ref().map(|t| t.address().to_string()))
            .field("pending_poll", &self.pending_poll.is_some())
            .finish()
    }
}
