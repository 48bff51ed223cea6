use crate::models::{LocalIdentity, Peer};

/// Source of validated peer and local identity records
pub trait PeerDirectory: Send + Sync {
    fn local_identity(&self) -> LocalIdentity;

    fn peers(&self) -> Vec<Peer>;

    /// Look a peer up by id, then by AE title
    fn find_peer(&self, id_or_ae_title: &str) -> Option<Peer> {
        let peers = self.peers();
        peers
            .iter()
            .find(|p| p.id == id_or_ae_title)
            .or_else(|| peers.iter().find(|p| p.ae_title == id_or_ae_title))
            .cloned()
    }
}
