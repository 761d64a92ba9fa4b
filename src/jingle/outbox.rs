//! Ordered per-session delivery of outbound actions.

use super::action::{OutboundAction, SignalingTransport};
use crate::error::CallError;
use crate::jid::BareJid;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct Envelope {
    account: BareJid,
    action: OutboundAction,
    reply: oneshot::Sender<Result<(), CallError>>,
}

/// Queue feeding one delivery task.
///
/// Actions pushed to the same outbox reach the transport in push order;
/// separate outboxes deliver independently. Dropping the outbox lets the
/// task drain what is already queued and exit.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn spawn(transport: Arc<dyn SignalingTransport>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let name = envelope.action.name();
                let sid = envelope.action.sid().to_string();
                let result = transport
                    .send(&envelope.account, envelope.action)
                    .await
                    .map_err(|e| {
                        warn!("Failed to deliver {} for {}: {:?}", name, sid, e);
                        CallError::ProtocolDeliveryFailed(e.to_string())
                    });
                if result.is_ok() {
                    debug!("Delivered {} for {}", name, sid);
                }
                let _ = envelope.reply.send(result);
            }
        });
        Self { tx }
    }

    pub fn push(&self, account: &BareJid, action: OutboundAction) -> Delivery {
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            account: account.clone(),
            action,
            reply,
        };
        if let Err(mpsc::error::SendError(envelope)) = self.tx.send(envelope) {
            let _ = envelope.reply.send(Err(CallError::ChannelClosed));
        }
        Delivery(vec![rx])
    }

    pub fn push_all(&self, account: &BareJid, actions: Vec<OutboundAction>) -> Delivery {
        let mut delivery = Delivery::default();
        for action in actions {
            delivery.merge(self.push(account, action));
        }
        delivery
    }
}

/// Completion of one or more queued actions.
#[derive(Debug, Default)]
pub struct Delivery(Vec<oneshot::Receiver<Result<(), CallError>>>);

impl Delivery {
    pub fn merge(&mut self, other: Delivery) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Wait for every action; the first failure wins.
    pub async fn wait(self) -> Result<(), CallError> {
        for rx in self.0 {
            rx.await??;
        }
        Ok(())
    }
}
