//! Configuration types for DIMSE associations

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::types::PresentationContextProposal;
use crate::uids;
use crate::{DimseError, Result, DEFAULT_DIMSE_PORT};

/// Parameters for requesting an association with a remote node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationRequest {
    /// Our own Application Entity Title
    pub calling_ae_title: String,

    /// Remote Application Entity Title
    pub called_ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Maximum PDU size we are willing to receive
    #[serde(default = "default_max_pdu")]
    pub max_pdu_length: u32,

    /// Bound on connect and on each read/write
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Contexts proposed, in order; IDs are assigned as 1, 3, 5, ...
    #[serde(default = "default_client_contexts")]
    pub presentation_contexts: Vec<PresentationContextProposal>,
}

/// Options for the listening side of an association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerOptions {
    /// Local Application Entity Title
    pub ae_title: String,

    /// Bind address for the listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the listener (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu_length: u32,

    /// Abstract syntaxes we accept
    #[serde(default = "default_listener_abstract_syntaxes")]
    pub abstract_syntaxes: Vec<String>,

    /// Also accept every standard storage SOP class
    #[serde(default = "default_accept_any_storage")]
    pub accept_any_storage: bool,

    /// Accepted transfer syntaxes (in order of preference)
    #[serde(default = "default_transfer_syntaxes")]
    pub transfer_syntaxes: Vec<String>,
}

impl AssociationRequest {
    /// Create a request proposing the default client presentation contexts
    pub fn new(
        calling_ae_title: impl Into<String>,
        called_ae_title: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            host: host.into(),
            port,
            max_pdu_length: default_max_pdu(),
            timeout: default_timeout(),
            presentation_contexts: default_client_contexts(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_pdu(mut self, size: u32) -> Self {
        self.max_pdu_length = size;
        self
    }

    /// Replace the proposed presentation contexts
    pub fn with_presentation_contexts(
        mut self,
        contexts: Vec<PresentationContextProposal>,
    ) -> Self {
        self.presentation_contexts = contexts;
        self
    }

    /// Socket address string for the remote node
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The ID that will be assigned to the context at `index`
    pub fn context_id(index: usize) -> u8 {
        (index * 2 + 1) as u8
    }

    /// Validate the request before touching the network
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.calling_ae_title)?;
        validate_ae_title(&self.called_ae_title)?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        if self.presentation_contexts.is_empty() {
            return Err(DimseError::config(
                "At least one presentation context must be proposed",
            ));
        }

        // IDs are odd values of a single byte
        if self.presentation_contexts.len() > 128 {
            return Err(DimseError::config(
                "At most 128 presentation contexts can be proposed",
            ));
        }

        if self
            .presentation_contexts
            .iter()
            .any(|pc| pc.transfer_syntaxes.is_empty())
        {
            return Err(DimseError::config(
                "Every presentation context needs at least one transfer syntax",
            ));
        }

        Ok(())
    }
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            ae_title: "DICOMNET_SCP".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu_length: default_max_pdu(),
            abstract_syntaxes: default_listener_abstract_syntaxes(),
            accept_any_storage: default_accept_any_storage(),
            transfer_syntaxes: default_transfer_syntaxes(),
        }
    }
}

impl ListenerOptions {
    /// Whether an abstract syntax proposed by a peer is one we serve
    pub fn accepts(&self, abstract_syntax: &str) -> bool {
        let uid = uids::trim_uid(abstract_syntax);
        self.abstract_syntaxes.iter().any(|a| a == uid)
            || (self.accept_any_storage && uids::is_storage_sop_class(uid))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;

        // Validate PDU size
        if self.max_pdu_length < 4096 || self.max_pdu_length > 131072 {
            return Err(DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if (self.abstract_syntaxes.is_empty() && !self.accept_any_storage)
            || self.transfer_syntaxes.is_empty()
        {
            return Err(DimseError::config(
                "Listener must accept at least one abstract and one transfer syntax",
            ));
        }

        Ok(())
    }
}

/// Check an AE title: 1-16 characters of `[A-Za-z0-9_-]`
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    if ae_title.is_empty() || ae_title.len() > 16 {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            ae_title
        )));
    }

    if !ae_title
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' may only contain letters, digits, '_' and '-'",
            ae_title
        )));
    }

    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

pub fn default_max_pdu() -> u32 {
    16384
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn default_transfer_syntaxes() -> Vec<String> {
    uids::TRANSFER_SYNTAX_PREFERENCE
        .iter()
        .map(|ts| ts.to_string())
        .collect()
}

/// Verification, Study Root Q/R and the common storage classes
pub fn default_client_contexts() -> Vec<PresentationContextProposal> {
    let ts = uids::TRANSFER_SYNTAX_PREFERENCE;
    [
        uids::VERIFICATION,
        uids::STUDY_ROOT_QR_FIND,
        uids::STUDY_ROOT_QR_MOVE,
        uids::STUDY_ROOT_QR_GET,
    ]
    .iter()
    .chain(uids::COMMON_STORAGE_SOP_CLASSES.iter())
    .map(|uid| PresentationContextProposal::new(*uid, ts))
    .collect()
}

fn default_listener_abstract_syntaxes() -> Vec<String> {
    std::iter::once(uids::VERIFICATION)
        .chain(uids::COMMON_STORAGE_SOP_CLASSES.iter().copied())
        .map(|uid| uid.to_string())
        .collect()
}

fn default_accept_any_storage() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listener_options() {
        let options = ListenerOptions::default();
        assert_eq!(options.port, DEFAULT_DIMSE_PORT);
        assert_eq!(options.abstract_syntaxes[0], uids::VERIFICATION);
        assert!(options
            .abstract_syntaxes
            .iter()
            .any(|a| a == uids::CT_IMAGE_STORAGE));
        assert!(options.accept_any_storage);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_listener_accepts_any_storage_class() {
        let options = ListenerOptions::default();
        assert!(options.accepts(uids::VERIFICATION));
        assert!(options.accepts("1.2.840.10008.5.1.4.1.1.88.67"));
        assert!(!options.accepts(uids::STUDY_ROOT_QR_FIND));

        let strict = ListenerOptions {
            accept_any_storage: false,
            ..ListenerOptions::default()
        };
        assert!(strict.accepts(uids::CT_IMAGE_STORAGE));
        assert!(!strict.accepts("1.2.840.10008.5.1.4.1.1.88.67"));
    }

    #[test]
    fn test_request_builder() {
        let request = AssociationRequest::new("LOCAL", "PACS_1", "localhost", 11112)
            .with_timeout(Duration::from_secs(10))
            .with_max_pdu(32768);

        assert_eq!(request.address(), "localhost:11112");
        assert_eq!(request.timeout, Duration::from_secs(10));
        assert_eq!(request.max_pdu_length, 32768);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_default_contexts_carry_full_preference_list() {
        let contexts = default_client_contexts();
        assert_eq!(contexts.len(), 10);
        assert_eq!(contexts[0].abstract_syntax, uids::VERIFICATION);
        for pc in &contexts {
            assert_eq!(pc.transfer_syntaxes, default_transfer_syntaxes());
        }
        assert_eq!(AssociationRequest::context_id(0), 1);
        assert_eq!(AssociationRequest::context_id(3), 7);
    }

    #[test]
    fn test_request_validation() {
        let mut request = AssociationRequest::new("LOCAL", "PACS", "localhost", 104);
        request.port = 0;
        assert!(request.validate().is_err());

        let request = AssociationRequest::new("LOCAL", "BAD TITLE", "localhost", 104);
        assert!(matches!(
            request.validate(),
            Err(DimseError::InvalidAeTitle(_))
        ));

        let request = AssociationRequest::new("LOCAL", "PACS", "localhost", 104)
            .with_presentation_contexts(vec![]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_ae_title_rules() {
        assert!(validate_ae_title("PACS_1").is_ok());
        assert!(validate_ae_title("A-B").is_ok());
        assert!(validate_ae_title("").is_err());
        assert!(validate_ae_title(&"A".repeat(17)).is_err());
        assert!(validate_ae_title("BAD TITLE").is_err());
    }
}
