// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notification routing.
//!
//! Registry changes produce notifications addressed to a [`ClientId`]. The
//! router holds one outbound queue per connected client and hands each
//! notification to the connection task that owns the socket.
//!
//! Dropping a client's queue ends its connection task, which is how lease
//! expiry closes the socket of a client that stopped heartbeating.

use rendez::master::{Notification, ServerFrame};
use rendez::ClientId;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// Delivery counters.
#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    /// Notifications queued for a connected client.
    pub delivered: u64,
    /// Notifications whose client was gone.
    pub dropped: u64,
}

/// Outbound queues indexed by client.
#[derive(Default)]
pub struct NotificationRouter {
    outboxes: HashMap<ClientId, UnboundedSender<ServerFrame>>,
    stats: RouterStats,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the outbound queue of a freshly registered client.
    pub fn register(&mut self, client_id: ClientId, tx: UnboundedSender<ServerFrame>) {
        self.outboxes.insert(client_id, tx);
    }

    /// Detach a client. Its connection task sees the queue close.
    pub fn unregister(&mut self, client_id: ClientId) -> bool {
        self.outboxes.remove(&client_id).is_some()
    }

    /// Queue every notification for its client. Returns how many were queued.
    pub fn dispatch(&mut self, notifications: Vec<(ClientId, Notification)>) -> usize {
        let mut sent = 0;
        for (client_id, notification) in notifications {
            let queued = self
                .outboxes
                .get(&client_id)
                .map(|tx| tx.send(ServerFrame::Notification { notification }).is_ok())
                .unwrap_or(false);
            if queued {
                self.stats.delivered += 1;
                sent += 1;
            } else {
                self.stats.dropped += 1;
                tracing::debug!("No outbox for {}, notification dropped", client_id);
            }
        }
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendez::NodeId;
    use tokio::sync::mpsc::unbounded_channel;

    fn closed(node: u64) -> Notification {
        Notification::TopicClosed {
            node_id: NodeId(node),
            topic: "chatter".into(),
        }
    }

    #[test]
    fn test_dispatch_to_registered_client() {
        let mut router = NotificationRouter::new();
        let (tx, mut rx) = unbounded_channel();
        router.register(ClientId(1), tx);

        let sent = router.dispatch(vec![(ClientId(1), closed(4)), (ClientId(2), closed(5))]);
        assert_eq!(sent, 1);
        assert_eq!(router.stats().delivered, 1);
        assert_eq!(router.stats().dropped, 1);

        match rx.try_recv().unwrap() {
            ServerFrame::Notification { notification } => assert_eq!(notification, closed(4)),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_closes_queue() {
        let mut router = NotificationRouter::new();
        let (tx, mut rx) = unbounded_channel();
        router.register(ClientId(3), tx);
        assert_eq!(router.connection_count(), 1);

        assert!(router.unregister(ClientId(3)));
        assert!(!router.unregister(ClientId(3)));
        assert_eq!(router.connection_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
