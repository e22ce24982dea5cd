//! Boundary with the peer-to-peer transport layer.

use utxod_chainstate::FailureClass;
use utxod_consensus::Hash256;

pub type PeerId = u64;

/// How badly a peer misbehaved; the transport turns this into a ban score.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Severity {
    /// Structurally broken data.
    Minor,
    /// Data that breaks a consensus rule.
    Severe,
}

impl Severity {
    pub fn score(self) -> u32 {
        match self {
            Severity::Minor => 20,
            Severity::Severe => 100,
        }
    }

    /// Penalty for a failure of `class`, if the sender is to blame.
    pub fn for_class(class: FailureClass) -> Option<Severity> {
        match class {
            FailureClass::Malformed => Some(Severity::Minor),
            FailureClass::ConsensusInvalid => Some(Severity::Severe),
            FailureClass::Conflicting
            | FailureClass::ResourceExhausted
            | FailureClass::StorageFatal
            | FailureClass::Transient => None,
        }
    }
}

/// Outbound requests the node makes of its peers. Implementations must not
/// block: they queue the message and return.
pub trait Transport: Send + Sync {
    fn request_headers(&self, peer: PeerId, locator: Vec<Hash256>);

    fn request_block(&self, peer: PeerId, hash: Hash256);

    fn report_misbehavior(&self, peer: PeerId, severity: Severity, reason: &str);
}

/// Transport that drops every request, for nodes fed only by local import.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn request_headers(&self, _peer: PeerId, _locator: Vec<Hash256>) {}

    fn request_block(&self, _peer: PeerId, _hash: Hash256) {}

    fn report_misbehavior(&self, _peer: PeerId, _severity: Severity, _reason: &str) {}
}
