//! DIMSE (DICOM Message Service Element) protocol engine
//!
//! This crate is the seam between the networking core and the DICOM upper
//! layer protocol. It exposes the engine primitives (open an association,
//! send a command, receive a command, close) behind traits, and ships an
//! implementation on top of `dicom-ul` for both the requestor (SCU) and the
//! acceptor (SCP) role.
//!
//! # Features
//! - Association requests with ordered presentation-context proposals
//! - Blocking listener with short accept polls
//! - Command-set builders for C-ECHO, C-FIND, C-MOVE, C-STORE and C-CANCEL
//! - P-DATA fragmentation bounded by the negotiated PDU size

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod pdata;
pub mod scp;
pub mod scu;
pub mod types;
pub mod uids;

// Re-export commonly used types
pub use config::{validate_ae_title, AssociationRequest, ListenerOptions};
pub use engine::{DimseAcceptor, DimseConnection, DimseEngine};
pub use error::{DimseError, Result};
pub use scp::UlAcceptor;
pub use scu::UlEngine;
pub use types::{
    DimseCommand, DimseMessage, DimseStatus, Incoming, NegotiatedContext,
    PresentationContextProposal, Priority, QueryLevel,
};

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
