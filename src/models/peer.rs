use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use dimse::config::default_transfer_syntaxes;
use dimse::{AssociationRequest, PresentationContextProposal};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A remote application entity we talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub ae_title: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_pdu_size")]
    pub max_pdu_size: u32,
    /// Abstract syntaxes to propose; the default client set when empty
    #[serde(default)]
    pub supported_syntaxes: Vec<String>,
    /// AE that C-MOVE sub-operations are sent to; our own AE when unset
    #[serde(default)]
    pub move_destination_ae: Option<String>,
}

/// How this process presents itself on the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub ae_title: String,
    #[serde(default = "default_storage_port")]
    pub storage_port: u16,
    #[serde(default = "default_temp_storage_path")]
    pub temp_storage_path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_pdu_size")]
    pub max_pdu_size: u32,
    #[serde(default = "default_storage_enabled")]
    pub storage_enabled: bool,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        ae_title: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ae_title: ae_title.into(),
            hostname: hostname.into(),
            port,
            timeout_seconds: default_timeout_seconds(),
            max_pdu_size: default_max_pdu_size(),
            supported_syntaxes: Vec::new(),
            move_destination_ae: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_move_destination(mut self, ae_title: impl Into<String>) -> Self {
        self.move_destination_ae = Some(ae_title.into());
        self
    }

    pub fn with_supported_syntaxes(mut self, syntaxes: Vec<String>) -> Self {
        self.supported_syntaxes = syntaxes;
        self
    }

    /// Pool and lookup key, `AE@host:port`
    pub fn key(&self) -> String {
        peer_key(&self.ae_title, &self.hostname, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ae_title(&self.ae_title)?;
        validate_hostname(&self.hostname)?;
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(format!(
                "peer '{}' has port 0",
                self.id
            )));
        }
        if !(4096..=131072).contains(&self.max_pdu_size) {
            return Err(ConfigError::InvalidPduSize(self.max_pdu_size));
        }
        Ok(())
    }

    /// Association parameters for talking to this peer as `local`.
    ///
    /// `syntaxes` overrides the proposed abstract syntaxes for one
    /// connection; otherwise the peer's own list, then the defaults, apply.
    pub fn association_request(
        &self,
        local: &LocalIdentity,
        syntaxes: Option<&[String]>,
    ) -> AssociationRequest {
        let request = AssociationRequest::new(
            local.ae_title.clone(),
            self.ae_title.clone(),
            self.hostname.clone(),
            self.port,
        )
        .with_timeout(self.timeout())
        .with_max_pdu(local.max_pdu_size.min(self.max_pdu_size));

        let chosen = match syntaxes {
            Some(list) if !list.is_empty() => list,
            _ => self.supported_syntaxes.as_slice(),
        };
        if chosen.is_empty() {
            return request;
        }

        let transfer_syntaxes = default_transfer_syntaxes();
        request.with_presentation_contexts(
            chosen
                .iter()
                .map(|abstract_syntax| PresentationContextProposal {
                    abstract_syntax: abstract_syntax.clone(),
                    transfer_syntaxes: transfer_syntaxes.clone(),
                })
                .collect(),
        )
    }
}

impl LocalIdentity {
    pub fn new(ae_title: impl Into<String>) -> Self {
        Self {
            ae_title: ae_title.into(),
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, port: u16, path: impl Into<PathBuf>) -> Self {
        self.storage_port = port;
        self.temp_storage_path = path.into();
        self.storage_enabled = true;
        self
    }

    pub fn with_storage_enabled(mut self, enabled: bool) -> Self {
        self.storage_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ae_title(&self.ae_title)?;
        if self.storage_enabled && self.temp_storage_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStoragePath(
                "storage is enabled but no storage path is set".into(),
            ));
        }
        if !(4096..=131072).contains(&self.max_pdu_size) {
            return Err(ConfigError::InvalidPduSize(self.max_pdu_size));
        }
        Ok(())
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self {
            ae_title: "DICOMNET".to_string(),
            storage_port: default_storage_port(),
            temp_storage_path: default_temp_storage_path(),
            max_connections: default_max_connections(),
            max_pdu_size: default_max_pdu_size(),
            storage_enabled: default_storage_enabled(),
        }
    }
}

/// `"{ae_title}@{hostname}:{port}"`
pub fn peer_key(ae_title: &str, hostname: &str, port: u16) -> String {
    format!("{}@{}:{}", ae_title, hostname, port)
}

/// AE titles are 1-16 characters of `[A-Za-z0-9_-]`
pub fn validate_ae_title(ae_title: &str) -> Result<(), ConfigError> {
    dimse::validate_ae_title(ae_title).map_err(|e| ConfigError::InvalidAeTitle(e.to_string()))
}

/// Dotted-quad IPv4 address or RFC 1123 host name
pub fn validate_hostname(hostname: &str) -> Result<(), ConfigError> {
    let invalid = |why: &str| ConfigError::InvalidHostname(format!("'{}': {}", hostname, why));

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(invalid("must be 1-253 characters"));
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    let all_numeric = labels
        .iter()
        .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()));
    if all_numeric {
        return hostname
            .parse::<Ipv4Addr>()
            .map(|_| ())
            .map_err(|_| invalid("not a valid IPv4 address"));
    }

    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("labels must be 1-63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("only letters, digits, '-' and '.' are allowed"));
        }
    }
    Ok(())
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_pdu_size() -> u32 {
    dimse::config::default_max_pdu()
}

fn default_storage_port() -> u16 {
    dimse::DEFAULT_DIMSE_PORT
}

fn default_temp_storage_path() -> PathBuf {
    PathBuf::from("./tmp/incoming")
}

fn default_max_connections() -> u32 {
    4
}

fn default_storage_enabled() -> bool {
    true
}
