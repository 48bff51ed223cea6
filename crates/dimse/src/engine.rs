//! The protocol engine seam
//!
//! Everything above this module drives DICOM networking through three
//! traits. [`DimseEngine`] opens associations (as requestor) and listeners
//! (as acceptor); a [`DimseConnection`] carries DIMSE messages over one
//! established association. PDU framing stays inside the engine.

use std::time::Duration;

use crate::config::{AssociationRequest, ListenerOptions};
use crate::types::{DimseMessage, Incoming, NegotiatedContext};
use crate::Result;

/// Factory for associations, both outbound and inbound
pub trait DimseEngine: Send + Sync {
    /// Request an association with a remote node.
    ///
    /// Fails with `ConnectionFailed` when the transport cannot be opened and
    /// with `AssociationRejected` when the peer refuses or accepts no context.
    fn open_association(&self, request: &AssociationRequest) -> Result<Box<dyn DimseConnection>>;

    /// Bind a listener that accepts inbound associations
    fn listen(&self, options: &ListenerOptions) -> Result<Box<dyn DimseAcceptor>>;
}

/// One established association
pub trait DimseConnection: Send {
    /// Presentation contexts accepted during negotiation
    fn presentation_contexts(&self) -> &[NegotiatedContext];

    /// AE title of the remote application entity
    fn peer_ae_title(&self) -> &str;

    /// Send a command set and its data set, if any
    fn send_command(&mut self, message: DimseMessage) -> Result<()>;

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns a `Timeout` error when nothing arrived in time; the
    /// association is still usable afterwards.
    fn receive_command(&mut self, timeout: Duration) -> Result<Incoming>;

    /// Orderly release (A-RELEASE), or the acknowledgement of one the peer requested
    fn release(&mut self) -> Result<()>;

    /// Abort the association (A-ABORT)
    fn abort(&mut self);

    /// First accepted context for the given abstract syntax
    fn context_for(&self, abstract_syntax: &str) -> Option<&NegotiatedContext> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.abstract_syntax.as_deref() == Some(abstract_syntax))
    }
}

/// A bound listener producing inbound associations
pub trait DimseAcceptor: Send {
    /// Wait up to `timeout` for a peer to request an association.
    ///
    /// `Ok(None)` means the wait timed out.
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn DimseConnection>>>;

    /// The address actually bound
    fn local_addr(&self) -> Option<std::net::SocketAddr>;
}
