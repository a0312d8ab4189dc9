//! Virtual channel memberships.
//!
//! A virtual channel is a one-directional trust relation between this node
//! and a peer:
//!
//! - *incoming*: the peer trusts us. We settle HTLCs and pay invoices on its
//!   behalf and book the difference as an offline debt.
//! - *outgoing*: we trust the peer. It is a candidate to pay for us when a
//!   direct payment fails, and we announce our virtual invoices to it.
//!
//! Memberships live for the lifetime of the process.

use bitcoin::secp256k1::PublicKey;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDirection {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for TrustDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustDirection::Incoming => write!(f, "incoming"),
            TrustDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{direction} virtual channel with {peer} already exists")]
    AlreadyExists {
        peer: PublicKey,
        direction: TrustDirection,
    },
    #[error("{0} is not a connected peer")]
    PeerUnknown(PublicKey),
}

#[derive(Debug, Default)]
struct Memberships {
    // Vecs keep insertion order, which is the order candidates are tried in.
    incoming: Vec<PublicKey>,
    outgoing: Vec<PublicKey>,
}

impl Memberships {
    fn set_mut(&mut self, direction: TrustDirection) -> &mut Vec<PublicKey> {
        match direction {
            TrustDirection::Incoming => &mut self.incoming,
            TrustDirection::Outgoing => &mut self.outgoing,
        }
    }
}

/// Tracks which peers we hold virtual channels with, in each direction.
#[derive(Debug, Default)]
pub struct VirtualChannelRegistry {
    inner: Mutex<Memberships>,
}

impl VirtualChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn add(&self, peer: PublicKey, direction: TrustDirection) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let set = inner.set_mut(direction);
        if set.contains(&peer) {
            return Err(RegistryError::AlreadyExists { peer, direction });
        }
        set.push(peer);
        Ok(())
    }

    /// Records that `peer` opened a virtual channel towards us. Opening the
    /// same channel twice is an error, it means the peers disagree on state.
    pub async fn open_outgoing_trust(&self, peer: PublicKey) -> Result<(), RegistryError> {
        self.add(peer, TrustDirection::Outgoing).await
    }

    /// Records that we trust `peer`. Checking that the peer is connected and
    /// notifying it is up to the caller.
    pub async fn open_incoming_trust(&self, peer: PublicKey) -> Result<(), RegistryError> {
        self.add(peer, TrustDirection::Incoming).await
    }

    /// Undoes [`Self::open_incoming_trust`] when the peer could not be told.
    pub async fn close_incoming_trust(&self, peer: &PublicKey) {
        self.inner.lock().await.incoming.retain(|p| p != peer);
    }

    pub async fn is_outgoing_trusted(&self, peer: &PublicKey) -> bool {
        self.inner.lock().await.outgoing.contains(peer)
    }

    pub async fn is_incoming_trusted(&self, peer: &PublicKey) -> bool {
        self.inner.lock().await.incoming.contains(peer)
    }

    /// Outgoing partners in the order they were added.
    pub async fn candidates_for_send(&self) -> Vec<PublicKey> {
        self.inner.lock().await.outgoing.clone()
    }

    pub async fn incoming_peers(&self) -> Vec<PublicKey> {
        self.inner.lock().await.incoming.clone()
    }
}
