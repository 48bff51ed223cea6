pub mod outcome;
pub mod peer;
pub mod query;

pub use outcome::{OperationOutcome, OperationStatus};
pub use peer::{peer_key, validate_ae_title, validate_hostname, LocalIdentity, Peer};
pub use query::{QueryFilter, RemoteSeriesInfo, RemoteStudyInfo};
