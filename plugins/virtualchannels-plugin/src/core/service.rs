//! The virtual channel service.
//!
//! Owns the registry, the receive ledger, the HTLC decision engine and the
//! payment orchestrator, and exposes the entry points the plugin glue calls
//! from hooks and RPC methods. Constructed once at start-up and shared
//! behind an `Arc`.

use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::core::htlc::{HtlcDecision, HtlcDecisionEngine};
use crate::core::ledger::{ReceiveLedger, ReceiveRecord};
use crate::core::payment::{
    FallbackPolicy, PaymentError, PaymentHandle, PaymentOrchestrator, PaymentRequest,
};
use crate::core::provider::{InvoiceProvider, PaymentProvider, PeerMessenger, PeerProvider};
use crate::core::registry::{RegistryError, VirtualChannelRegistry};
use crate::proto::messages::{
    ascii_text, InitVirtualChannel, InitVirtualReceive, InitVirtualSend, Message, VirtualSendFailure,
    VirtualSendSuccess,
};
use crate::proto::primitives::{Msat, PaymentHash, Preimage};

const UNTRUSTED_REASON: &str = "no virtual channel with requester";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// A message to send back to the peer whose message we just handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyIntent {
    pub peer: PublicKey,
    pub message: Message,
}

/// The external collaborators the service talks to.
#[derive(Clone)]
pub struct Providers {
    pub payer: Arc<dyn PaymentProvider>,
    pub messenger: Arc<dyn PeerMessenger>,
    pub peers: Arc<dyn PeerProvider>,
    pub invoices: Arc<dyn InvoiceProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelListing {
    pub incoming: Vec<PublicKey>,
    pub outgoing: Vec<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnounceFailure {
    pub peer: PublicKey,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualInvoice {
    pub bolt11: String,
    pub payment_hash: PaymentHash,
    pub announced_to: Vec<PublicKey>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<AnnounceFailure>,
}

pub struct VirtualChannelService {
    registry: Arc<VirtualChannelRegistry>,
    ledger: Arc<ReceiveLedger>,
    htlc_engine: HtlcDecisionEngine,
    orchestrator: PaymentOrchestrator,
    providers: Providers,
}

impl VirtualChannelService {
    pub fn new(providers: Providers, policy: FallbackPolicy) -> Self {
        let ledger = Arc::new(ReceiveLedger::new());
        Self {
            registry: Arc::new(VirtualChannelRegistry::new()),
            htlc_engine: HtlcDecisionEngine::new(ledger.clone()),
            ledger,
            orchestrator: PaymentOrchestrator::new(
                providers.payer.clone(),
                providers.messenger.clone(),
                policy,
            ),
            providers,
        }
    }

    pub fn registry(&self) -> &VirtualChannelRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &ReceiveLedger {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &PaymentOrchestrator {
        &self.orchestrator
    }

    // ========================================================================
    // HTLCs
    // ========================================================================

    pub async fn decide_htlc(
        &self,
        payment_hash: PaymentHash,
        offered: Msat,
        current_height: u32,
    ) -> HtlcDecision {
        self.decide_htlc_at(payment_hash, offered, current_height, Utc::now())
            .await
    }

    pub async fn decide_htlc_at(
        &self,
        payment_hash: PaymentHash,
        offered: Msat,
        current_height: u32,
        now: DateTime<Utc>,
    ) -> HtlcDecision {
        self.htlc_engine
            .decide(payment_hash, offered, current_height, now)
            .await
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// A peer told us it trusts us.
    pub async fn open_outgoing_trust(&self, peer: PublicKey) -> Result<(), RegistryError> {
        self.registry.open_outgoing_trust(peer).await?;
        log::info!("Opened outgoing virtual channel with {}", peer);
        Ok(())
    }

    /// Trust `peer` and let it know with an `InitVirtualChannel`. Concurrent
    /// opens notify the peer at most once. The membership is released again
    /// if the peer could not be told.
    pub async fn open_incoming_trust(&self, peer: PublicKey) -> Result<(), ServiceError> {
        if !self.providers.peers.is_connected(&peer).await? {
            return Err(RegistryError::PeerUnknown(peer).into());
        }
        self.registry.open_incoming_trust(peer).await?;

        let notified = self
            .providers
            .messenger
            .send_message(&peer, &Message::InitVirtualChannel(InitVirtualChannel))
            .await;
        if let Err(e) = notified {
            self.registry.close_incoming_trust(&peer).await;
            return Err(e.into());
        }
        log::info!("Opened incoming virtual channel with {}", peer);
        Ok(())
    }

    pub async fn list_channels(&self) -> ChannelListing {
        ChannelListing {
            incoming: self.registry.incoming_peers().await,
            outgoing: self.registry.candidates_for_send().await,
        }
    }

    // ========================================================================
    // Payments
    // ========================================================================

    /// Pays `request.bolt11`, falling back to outgoing partners. The invoice
    /// is decoded first so partner preimages can be checked against it.
    pub async fn start_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentHandle, ServiceError> {
        request.check_ascii()?;
        let terms = self
            .providers
            .invoices
            .decode_invoice(&request.bolt11)
            .await?;
        let candidates = self.registry.candidates_for_send().await;
        Ok(self
            .orchestrator
            .start_payment(request, terms.payment_hash, candidates)
            .await?)
    }

    /// Creates an invoice for `amount` and hands its preimage to every
    /// outgoing partner, so any of them can settle payments to it.
    pub async fn create_virtual_invoice(
        &self,
        amount: Msat,
        label: &str,
        description: &str,
    ) -> Result<VirtualInvoice, ServiceError> {
        let mut secret = [0u8; 32];
        rand::rng().fill(&mut secret);
        let preimage = Preimage(secret);

        let bolt11 = self
            .providers
            .invoices
            .create_invoice(amount, label, description, &preimage)
            .await?;

        let message = Message::InitVirtualReceive(InitVirtualReceive {
            preimage,
            bolt11: bolt11.clone(),
        });
        let mut announced_to = vec![];
        let mut failed = vec![];
        for peer in self.registry.candidates_for_send().await {
            match self.providers.messenger.send_message(&peer, &message).await {
                Ok(()) => announced_to.push(peer),
                Err(e) => {
                    log::warn!("Failed to announce invoice to {}: {:#}", peer, e);
                    failed.push(AnnounceFailure {
                        peer,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        Ok(VirtualInvoice {
            bolt11,
            payment_hash: preimage.payment_hash(),
            announced_to,
            failed,
        })
    }

    // ========================================================================
    // Peer messages
    // ========================================================================

    /// Delivers a reply produced by [`Self::handle_peer_message`].
    pub async fn send_reply(&self, reply: &ReplyIntent) -> anyhow::Result<()> {
        self.providers
            .messenger
            .send_message(&reply.peer, &reply.message)
            .await
    }

    /// Handles a raw custom message from `peer`. Messages that are not ours
    /// or do not decode are dropped.
    pub async fn handle_peer_message(&self, peer: PublicKey, raw: &[u8]) -> Option<ReplyIntent> {
        let message = match Message::decode(raw) {
            Ok(Some(message)) => message,
            Ok(None) => {
                log::trace!("Ignoring unrelated custom message from {}", peer);
                return None;
            }
            Err(e) => {
                log::warn!("Dropping malformed message from {}: {}", peer, e);
                return None;
            }
        };

        match message {
            Message::InitVirtualChannel(_) => {
                if let Err(e) = self.open_outgoing_trust(peer).await {
                    log::warn!("Ignoring InitVirtualChannel from {}: {}", peer, e);
                }
                None
            }
            Message::InitVirtualReceive(m) => {
                self.on_init_virtual_receive(peer, m).await;
                None
            }
            Message::InitVirtualSend(m) => Some(self.on_init_virtual_send(peer, m).await),
            Message::VirtualSendSuccess(m) => {
                if self.reply_is_trusted(&peer, "VirtualSendSuccess").await {
                    self.orchestrator
                        .on_virtual_send_success(&peer, &m.bolt11, m.preimage)
                        .await;
                }
                None
            }
            Message::VirtualSendFailure(m) => {
                if self.reply_is_trusted(&peer, "VirtualSendFailure").await {
                    self.orchestrator
                        .on_virtual_send_failure(&peer, &m.bolt11, m.reason)
                        .await;
                }
                None
            }
        }
    }

    async fn reply_is_trusted(&self, peer: &PublicKey, what: &str) -> bool {
        let trusted = self.registry.is_outgoing_trusted(peer).await;
        if !trusted {
            log::warn!("Ignoring {} from {}, not an outgoing partner", what, peer);
        }
        trusted
    }

    async fn on_init_virtual_receive(&self, peer: PublicKey, m: InitVirtualReceive) {
        if !self.registry.is_incoming_trusted(&peer).await {
            log::warn!("Ignoring InitVirtualReceive from untrusted peer {}", peer);
            return;
        }

        let terms = match self.providers.invoices.decode_invoice(&m.bolt11).await {
            Ok(terms) => terms,
            Err(e) => {
                log::warn!("Ignoring InitVirtualReceive from {}: {:#}", peer, e);
                return;
            }
        };

        let payment_hash = m.preimage.payment_hash();
        if terms.payment_hash != payment_hash {
            log::warn!(
                "Ignoring InitVirtualReceive from {}: preimage does not match invoice hash {}",
                peer,
                terms.payment_hash
            );
            return;
        }

        log::info!(
            "Receiving payment_hash {} on behalf of {}",
            payment_hash,
            peer
        );
        self.ledger
            .record_receive(
                payment_hash,
                ReceiveRecord {
                    preimage: m.preimage,
                    bolt11: m.bolt11,
                    terms,
                },
            )
            .await;
    }

    async fn on_init_virtual_send(&self, peer: PublicKey, m: InitVirtualSend) -> ReplyIntent {
        let bolt11 = m.bolt11.clone();
        let failure = |reason: String| ReplyIntent {
            peer,
            message: Message::VirtualSendFailure(VirtualSendFailure {
                bolt11: bolt11.clone(),
                reason: Some(reason),
            }),
        };

        if !self.registry.is_incoming_trusted(&peer).await {
            log::warn!("Refusing to pay {} for untrusted peer {}", m.bolt11, peer);
            return failure(UNTRUSTED_REASON.to_string());
        }

        log::info!("Paying {} on behalf of {}", m.bolt11, peer);
        match self.providers.payer.pay(&PaymentRequest::from(m)).await {
            Ok(preimage) => ReplyIntent {
                peer,
                message: Message::VirtualSendSuccess(VirtualSendSuccess {
                    bolt11: bolt11.clone(),
                    preimage,
                }),
            },
            Err(e) => {
                log::info!("Payment of {} for {} failed: {:#}", bolt11, peer, e);
                failure(ascii_text(&format!("{:#}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::InvoiceTerms;
    use crate::core::registry::tests::peer;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockNode {
        pay_result: Mutex<Option<Preimage>>,
        paid: Mutex<Vec<PaymentRequest>>,
        sent: Mutex<Vec<(PublicKey, Message)>>,
        connected: Vec<PublicKey>,
        unreachable: Vec<PublicKey>,
        pay_error: Option<String>,
        invoices: Mutex<HashMap<String, InvoiceTerms>>,
    }

    #[async_trait]
    impl PaymentProvider for MockNode {
        async fn pay(&self, request: &PaymentRequest) -> anyhow::Result<Preimage> {
            self.paid.lock().unwrap().push(request.clone());
            let error = self.pay_error.clone().unwrap_or_else(|| "no route".to_string());
            self.pay_result.lock().unwrap().ok_or_else(|| anyhow!(error))
        }
    }

    #[async_trait]
    impl PeerMessenger for MockNode {
        async fn send_message(&self, peer: &PublicKey, message: &Message) -> anyhow::Result<()> {
            if !self.connected.contains(peer) || self.unreachable.contains(peer) {
                return Err(anyhow!("peer not connected"));
            }
            self.sent.lock().unwrap().push((*peer, message.clone()));
            Ok(())
        }
    }

    #[async_trait]
    impl PeerProvider for MockNode {
        async fn is_connected(&self, peer: &PublicKey) -> anyhow::Result<bool> {
            Ok(self.connected.contains(peer))
        }
    }

    #[async_trait]
    impl InvoiceProvider for MockNode {
        async fn decode_invoice(&self, bolt11: &str) -> anyhow::Result<InvoiceTerms> {
            self.invoices
                .lock()
                .unwrap()
                .get(bolt11)
                .cloned()
                .ok_or_else(|| anyhow!("invalid bolt11"))
        }

        async fn create_invoice(
            &self,
            amount: Msat,
            label: &str,
            _description: &str,
            preimage: &Preimage,
        ) -> anyhow::Result<String> {
            let bolt11 = format!("lnbcrt{}{}", amount.msat(), label);
            self.invoices.lock().unwrap().insert(
                bolt11.clone(),
                InvoiceTerms {
                    payment_hash: preimage.payment_hash(),
                    amount_msat: Some(amount),
                    created_at: 1_700_000_000,
                    expiry: 3600,
                },
            );
            Ok(bolt11)
        }
    }

    fn service(node: Arc<MockNode>) -> VirtualChannelService {
        VirtualChannelService::new(
            Providers {
                payer: node.clone(),
                messenger: node.clone(),
                peers: node.clone(),
                invoices: node,
            },
            FallbackPolicy::default(),
        )
    }

    fn node(connected: Vec<PublicKey>) -> Arc<MockNode> {
        Arc::new(MockNode {
            connected,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_open_incoming_trust_notifies_peer() {
        let p = peer(1);
        let n = node(vec![p]);
        let s = service(n.clone());

        s.open_incoming_trust(p).await.unwrap();

        assert!(s.registry().is_incoming_trusted(&p).await);
        assert_eq!(
            n.sent.lock().unwrap().clone(),
            vec![(p, Message::InitVirtualChannel(InitVirtualChannel))]
        );
        assert!(matches!(
            s.open_incoming_trust(p).await,
            Err(ServiceError::Registry(RegistryError::AlreadyExists { .. }))
        ));
        assert_eq!(n.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_opens_notify_once() {
        let p = peer(1);
        let n = node(vec![p]);
        let s = service(n.clone());

        let (a, b) = tokio::join!(s.open_incoming_trust(p), s.open_incoming_trust(p));

        assert!(a.is_ok() != b.is_ok());
        assert_eq!(n.sent.lock().unwrap().len(), 1);
        assert_eq!(s.registry().incoming_peers().await, vec![p]);
    }

    #[tokio::test]
    async fn test_failed_notification_releases_membership() {
        let p = peer(1);
        let n = Arc::new(MockNode {
            connected: vec![p],
            unreachable: vec![p],
            ..Default::default()
        });
        let s = service(n);

        assert!(matches!(
            s.open_incoming_trust(p).await,
            Err(ServiceError::Provider(_))
        ));
        assert!(!s.registry().is_incoming_trusted(&p).await);
    }

    #[tokio::test]
    async fn test_open_incoming_trust_requires_connected_peer() {
        let s = service(node(vec![]));
        let p = peer(1);

        assert!(matches!(
            s.open_incoming_trust(p).await,
            Err(ServiceError::Registry(RegistryError::PeerUnknown(pk))) if pk == p
        ));
        assert!(!s.registry().is_incoming_trusted(&p).await);
    }

    #[tokio::test]
    async fn test_init_virtual_channel_grants_outgoing_trust() {
        let s = service(node(vec![]));
        let p = peer(1);
        let raw = Message::InitVirtualChannel(InitVirtualChannel).encode();

        assert_eq!(s.handle_peer_message(p, &raw).await, None);
        assert_eq!(s.registry().candidates_for_send().await, vec![p]);

        // A repeated announcement is logged and ignored.
        assert_eq!(s.handle_peer_message(p, &raw).await, None);
        assert_eq!(s.registry().candidates_for_send().await, vec![p]);
    }

    #[tokio::test]
    async fn test_unrelated_and_malformed_messages_are_ignored() {
        let s = service(node(vec![]));
        assert_eq!(s.handle_peer_message(peer(1), &[0xde, 0xad, 1]).await, None);
        assert_eq!(s.handle_peer_message(peer(1), &[0xff, 0xaf, 0x00]).await, None);
        assert_eq!(s.handle_peer_message(peer(1), &[]).await, None);
    }

    #[tokio::test]
    async fn test_init_virtual_send_from_untrusted_peer_is_refused() {
        let n = node(vec![]);
        *n.pay_result.lock().unwrap() = Some(Preimage([1; 32]));
        let s = service(n.clone());
        let p = peer(1);
        let raw = Message::InitVirtualSend(InitVirtualSend {
            bolt11: "lnbc1".to_string(),
            ..Default::default()
        })
        .encode();

        let reply = s.handle_peer_message(p, &raw).await.unwrap();
        assert_eq!(reply.peer, p);
        assert_eq!(
            reply.message,
            Message::VirtualSendFailure(VirtualSendFailure {
                bolt11: "lnbc1".to_string(),
                reason: Some(UNTRUSTED_REASON.to_string()),
            })
        );
        assert!(n.paid.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_virtual_send_pays_for_trusted_peer() {
        let p = peer(1);
        let n = node(vec![p]);
        *n.pay_result.lock().unwrap() = Some(Preimage([7; 32]));
        let s = service(n.clone());
        s.open_incoming_trust(p).await.unwrap();

        let request = InitVirtualSend {
            bolt11: "lnbc1".to_string(),
            amount_msat: Some(Msat(1_000)),
            ..Default::default()
        };
        let raw = Message::InitVirtualSend(request.clone()).encode();

        let reply = s.handle_peer_message(p, &raw).await.unwrap();
        assert_eq!(
            reply.message,
            Message::VirtualSendSuccess(VirtualSendSuccess {
                bolt11: "lnbc1".to_string(),
                preimage: Preimage([7; 32]),
            })
        );
        assert_eq!(n.paid.lock().unwrap().clone(), vec![PaymentRequest::from(request)]);
    }

    #[tokio::test]
    async fn test_init_virtual_send_reports_payment_error() {
        let p = peer(1);
        let s = service(node(vec![p]));
        s.open_incoming_trust(p).await.unwrap();
        let raw = Message::InitVirtualSend(InitVirtualSend {
            bolt11: "lnbc1".to_string(),
            ..Default::default()
        })
        .encode();

        let reply = s.handle_peer_message(p, &raw).await.unwrap();
        assert_eq!(
            reply.message,
            Message::VirtualSendFailure(VirtualSendFailure {
                bolt11: "lnbc1".to_string(),
                reason: Some("no route".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_non_ascii_payment_error_survives_the_wire() {
        let p = peer(1);
        let n = Arc::new(MockNode {
            connected: vec![p],
            pay_error: Some("route bloquée".to_string()),
            ..Default::default()
        });
        let s = service(n);
        s.open_incoming_trust(p).await.unwrap();
        let raw = Message::InitVirtualSend(InitVirtualSend {
            bolt11: "lnbc1".to_string(),
            ..Default::default()
        })
        .encode();

        let reply = s.handle_peer_message(p, &raw).await.unwrap();
        let decoded = Message::decode(&reply.message.encode()).unwrap().unwrap();
        let Message::VirtualSendFailure(failure) = decoded else {
            panic!("expected VirtualSendFailure");
        };
        assert_eq!(failure.reason.as_deref(), Some("route bloqu\\u{e9}e"));
    }

    #[tokio::test]
    async fn test_start_payment_checks_request_and_invoice() {
        let p1 = peer(1);
        let n = node(vec![p1]);
        let s = service(n.clone());
        s.open_outgoing_trust(p1).await.unwrap();

        let request = PaymentRequest {
            label: Some("café".to_string()),
            ..PaymentRequest::new("lnbc1")
        };
        assert!(matches!(
            s.start_payment(request).await,
            Err(ServiceError::Payment(PaymentError::NotAscii { field: "label" }))
        ));

        assert!(matches!(
            s.start_payment(PaymentRequest::new("garbage")).await,
            Err(ServiceError::Provider(_))
        ));
        assert_eq!(s.orchestrator().pending_count().await, 0);
        assert!(n.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_virtual_receive_populates_ledger() {
        let p = peer(1);
        let n = node(vec![p]);
        let s = service(n.clone());
        s.open_incoming_trust(p).await.unwrap();

        let preimage = Preimage([0xab; 32]);
        let bolt11 = n
            .create_invoice(Msat(9_000_000), "x", "", &preimage)
            .await
            .unwrap();
        let raw = Message::InitVirtualReceive(InitVirtualReceive {
            preimage,
            bolt11: bolt11.clone(),
        })
        .encode();

        assert_eq!(s.handle_peer_message(p, &raw).await, None);
        let record = s.ledger().lookup(&preimage.payment_hash()).await.unwrap();
        assert_eq!(record.bolt11, bolt11);

        let now = Utc.timestamp_opt(1_700_000_010, 0).unwrap();
        assert_eq!(
            s.decide_htlc_at(preimage.payment_hash(), Msat(9_000_000), 100, now)
                .await,
            HtlcDecision::Resolve { preimage }
        );
    }

    #[tokio::test]
    async fn test_init_virtual_receive_checks_trust_and_hash() {
        let p = peer(1);
        let n = node(vec![p]);
        let s = service(n.clone());

        let preimage = Preimage([0xab; 32]);
        let bolt11 = n.create_invoice(Msat(1), "x", "", &preimage).await.unwrap();

        // Not trusted yet.
        let raw = Message::InitVirtualReceive(InitVirtualReceive {
            preimage,
            bolt11: bolt11.clone(),
        })
        .encode();
        s.handle_peer_message(p, &raw).await;
        assert_eq!(s.ledger().len().await, 0);

        // Trusted, but the preimage belongs to another invoice.
        s.open_incoming_trust(p).await.unwrap();
        let raw = Message::InitVirtualReceive(InitVirtualReceive {
            preimage: Preimage([0xcd; 32]),
            bolt11,
        })
        .encode();
        s.handle_peer_message(p, &raw).await;
        assert_eq!(s.ledger().len().await, 0);
    }

    #[tokio::test]
    async fn test_create_virtual_invoice_announces_to_partners() {
        let (p1, p2) = (peer(1), peer(2));
        let n = node(vec![p1]);
        let s = service(n.clone());
        s.open_outgoing_trust(p1).await.unwrap();
        s.open_outgoing_trust(p2).await.unwrap();

        let invoice = s
            .create_virtual_invoice(Msat(5_000), "inv", "test")
            .await
            .unwrap();

        assert_eq!(invoice.announced_to, vec![p1]);
        assert_eq!(invoice.failed.len(), 1);
        assert_eq!(invoice.failed[0].peer, p2);

        let sent = n.sent.lock().unwrap().clone();
        let Message::InitVirtualReceive(m) = &sent[0].1 else {
            panic!("expected InitVirtualReceive");
        };
        assert_eq!(m.bolt11, invoice.bolt11);
        assert_eq!(m.preimage.payment_hash(), invoice.payment_hash);
    }

    #[tokio::test]
    async fn test_replies_from_non_partners_are_ignored() {
        let (p1, stranger) = (peer(1), peer(9));
        let n = node(vec![p1]);
        let s = service(n.clone());
        s.open_outgoing_trust(p1).await.unwrap();

        let preimage = Preimage([1; 32]);
        let bolt11 = n.create_invoice(Msat(1_000), "x", "", &preimage).await.unwrap();
        let handle = s.start_payment(PaymentRequest::new(&bolt11)).await.unwrap();
        let raw = Message::VirtualSendSuccess(VirtualSendSuccess { bolt11, preimage }).encode();

        s.handle_peer_message(stranger, &raw).await;
        assert_eq!(s.orchestrator().pending_count().await, 1);

        s.handle_peer_message(p1, &raw).await;
        let success = handle.wait().await.unwrap();
        assert_eq!(success.partner, Some(p1));
    }
}
