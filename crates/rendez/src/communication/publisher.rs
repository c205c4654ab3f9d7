// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic publisher.

use super::message::Message;
use super::TopicState;
use crate::channel::{ChannelDescriptor, NegotiatedChannel};
use crate::master::client::Role;
use crate::master::{MasterClient, MasterRequest, MasterResponse};
use crate::node::{NodeId, NodeIdentity};
use crate::status::Status;
use crate::transport::{PendingListeners, PublisherLink};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Clone)]
struct Registration {
    node_id: NodeId,
    topic: String,
}

struct PubState {
    state: TopicState,
    registration: Option<Registration>,
    descriptor: Option<ChannelDescriptor>,
    channel: Option<NegotiatedChannel>,
    link: Option<PublisherLink>,
    /// Bumped on every request and teardown; stale replies are ignored.
    generation: u64,
}

impl PubState {
    /// Drop the live registration, returning what must be released.
    fn teardown(&mut self, next: TopicState) -> Option<Registration> {
        self.generation += 1;
        self.state = next;
        self.channel = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.registration.take()
    }
}

struct PubInner {
    client: MasterClient,
    state: Mutex<PubState>,
}

impl PubInner {
    fn unpublish_at_master<F>(&self, reg: Registration, on_reply: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        self.client.release(reg.node_id, &reg.topic, Role::Publisher);
        self.client.call(
            MasterRequest::UnpublishTopic {
                node_id: reg.node_id,
                topic: reg.topic,
            },
            move |result| on_reply(result.err().unwrap_or_else(Status::ok_status)),
        );
    }

    fn finish_publish(
        &self,
        generation: u64,
        listeners: PendingListeners,
        result: Result<MasterResponse, Status>,
    ) -> Status {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Status::unregistered("unpublished before the registration completed");
        }
        let channel = match result {
            Ok(MasterResponse::TopicPublished { channel }) => channel,
            Ok(other) => {
                let status = Status::internal(format!("unexpected reply to publish_topic: {:?}", other));
                if let Some(reg) = state.teardown(TopicState::Failed) {
                    drop(state);
                    self.unpublish_at_master(reg, |_| {});
                }
                return status;
            }
            Err(status) => {
                if let Some(reg) = state.teardown(TopicState::Failed) {
                    self.client.release(reg.node_id, &reg.topic, Role::Publisher);
                }
                return status;
            }
        };

        let descriptor = state.descriptor.clone().unwrap_or_default();
        match listeners.activate(&channel, &descriptor) {
            Ok(link) => {
                if let Some(reg) = &state.registration {
                    log::info!("[publisher] '{}' negotiated {} on {}", reg.topic, channel.kind, channel.endpoint);
                }
                state.link = Some(link);
                state.channel = Some(channel);
                state.state = TopicState::Negotiated;
                Status::ok_status()
            }
            Err(e) => {
                let status: Status = e.into();
                log::warn!("[publisher] cannot open negotiated channel: {}", status);
                if let Some(reg) = state.teardown(TopicState::Failed) {
                    drop(state);
                    self.unpublish_at_master(reg, |_| {});
                }
                status
            }
        }
    }
}

impl Drop for PubInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.state.is_active() {
            if let Some(reg) = state.teardown(TopicState::Unregistered) {
                self.unpublish_at_master(reg, |_| {});
            }
        }
    }
}

/// Publishing end of one topic.
///
/// Cheap to clone; clones share the registration. All callbacks run on the
/// event loop.
pub struct Publisher<M: Message> {
    inner: Arc<PubInner>,
    _marker: PhantomData<fn(M)>,
}

impl<M: Message> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: Message> Publisher<M> {
    pub fn new(client: &MasterClient) -> Self {
        Self {
            inner: Arc::new(PubInner {
                client: client.clone(),
                state: Mutex::new(PubState {
                    state: TopicState::Unregistered,
                    registration: None,
                    descriptor: None,
                    channel: None,
                    link: None,
                    generation: 0,
                }),
            }),
            _marker: PhantomData,
        }
    }

    pub fn state(&self) -> TopicState {
        self.inner.state.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == TopicState::Negotiated
    }

    pub fn is_unregistered(&self) -> bool {
        matches!(self.state(), TopicState::Unregistered | TopicState::Failed)
    }

    pub fn topic(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .registration
            .as_ref()
            .map(|r| r.topic.clone())
    }

    /// Channel chosen by the Master, once negotiated.
    pub fn channel(&self) -> Option<NegotiatedChannel> {
        self.inner.state.lock().channel.clone()
    }

    /// Number of subscribers currently attached to the channel.
    pub fn peer_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .link
            .as_ref()
            .map_or(0, PublisherLink::peer_count)
    }

    /// Register as the publisher of `topic`.
    ///
    /// Listeners for every requested kind are opened first and advertised
    /// to the Master. `on_result` fires once the Master negotiated a channel
    /// (which is then open) or refused the registration. A second live
    /// registration of the same (node, topic) fails with `AlreadyExists`
    /// without contacting the Master.
    pub fn request_publish<F>(
        &self,
        identity: &NodeIdentity,
        topic: &str,
        descriptor: ChannelDescriptor,
        on_result: F,
    ) where
        F: FnOnce(Status) + Send + 'static,
    {
        let client = &self.inner.client;
        if self.state().is_active() {
            let status = Status::already_exists(format!(
                "publisher is already registered for '{}'",
                self.topic().unwrap_or_default()
            ));
            client.handle().post_task(move || on_result(status));
            return;
        }
        if let Err(status) = client.claim(identity.id, topic, Role::Publisher) {
            client.handle().post_task(move || on_result(status));
            return;
        }

        let opened = PendingListeners::open(&descriptor, client.config(), topic)
            .and_then(|listeners| listeners.endpoints().map(|endpoints| (listeners, endpoints)));
        let (listeners, endpoints) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                client.release(identity.id, topic, Role::Publisher);
                let status: Status = e.into();
                client.handle().post_task(move || on_result(status));
                return;
            }
        };
        let mut wire = descriptor.to_wire();
        wire.kinds = listeners.kinds();

        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.state = TopicState::Pending;
            state.registration = Some(Registration {
                node_id: identity.id,
                topic: topic.to_string(),
            });
            state.descriptor = Some(descriptor);
            state.channel = None;
            state.generation
        };

        log::debug!("[publisher] requesting '{}' for {}", topic, identity);
        let request = MasterRequest::PublishTopic {
            node_id: identity.id,
            topic: topic.to_string(),
            schema_id: M::schema_id(),
            descriptor: wire,
            endpoints,
        };
        let weak = Arc::downgrade(&self.inner);
        client.call(request, move |result| {
            let status = match weak.upgrade() {
                Some(inner) => inner.finish_publish(generation, listeners, result),
                None => Status::unregistered("publisher was dropped"),
            };
            on_result(status);
        });
    }

    /// Queue `message` on the negotiated channel.
    ///
    /// Fails with `Unregistered` before registration or after unpublish,
    /// `Backpressure` when the fixed queue is full, and `BufferTooSmall`
    /// when the encoded message exceeds a fixed buffer. Never blocks.
    pub fn publish(&self, message: &M) -> Result<(), Status> {
        let state = self.inner.state.lock();
        match state.state {
            TopicState::Negotiated => {}
            TopicState::Pending => {
                return Err(Status::invalid_state("publish before the channel is negotiated"))
            }
            TopicState::Unregistered | TopicState::Failed => {
                return Err(Status::unregistered("publisher is not registered"))
            }
        }
        let link = state
            .link
            .as_ref()
            .ok_or_else(|| Status::internal("negotiated publisher has no channel"))?;
        link.try_send(message.encode()?)
    }

    /// Like [`publish`](Self::publish), reporting the outcome to `on_sent`
    /// on the event loop.
    pub fn publish_with<F>(&self, message: &M, on_sent: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let status = self.publish(message).err().unwrap_or_else(Status::ok_status);
        self.inner.client.handle().post_task(move || on_sent(status));
    }

    /// Tear the channel down and unregister at the Master.
    ///
    /// Idempotent: unpublishing a topic that is not registered succeeds.
    pub fn request_unpublish<F>(&self, identity: &NodeIdentity, topic: &str, on_result: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let reg = {
            let mut state = self.inner.state.lock();
            let matches = state
                .registration
                .as_ref()
                .is_some_and(|r| r.node_id == identity.id && r.topic == topic);
            if matches && state.state.is_active() {
                state.teardown(TopicState::Unregistered)
            } else {
                None
            }
        };
        match reg {
            Some(reg) => {
                log::debug!("[publisher] unpublishing '{}' for {}", reg.topic, identity);
                self.inner.unpublish_at_master(reg, on_result);
            }
            None => self
                .inner
                .client
                .handle()
                .post_task(move || on_result(Status::ok_status())),
        }
    }

    /// Publish `make()` every `period` until the publisher is unregistered.
    ///
    /// Each tick checks the registration first, so the task stops within one
    /// period of an unpublish. Ticks while the registration is still pending
    /// publish nothing.
    pub fn publish_repeating<F>(&self, period: Duration, make: F)
    where
        F: FnMut() -> M + Send + 'static,
    {
        schedule_repeating::<M, F>(Arc::downgrade(&self.inner), self.inner.client.clone(), period, make);
    }
}

fn schedule_repeating<M, F>(weak: Weak<PubInner>, client: MasterClient, period: Duration, mut make: F)
where
    M: Message,
    F: FnMut() -> M + Send + 'static,
{
    let handle = client.handle().clone();
    handle.post_delayed_task(
        move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let publisher = Publisher::<M> {
                inner,
                _marker: PhantomData,
            };
            match publisher.state() {
                TopicState::Unregistered | TopicState::Failed => {
                    log::debug!("[publisher] repeating publish stopped");
                    return;
                }
                TopicState::Pending => {}
                TopicState::Negotiated => {
                    if let Err(status) = publisher.publish(&make()) {
                        log::warn!("[publisher] repeating publish failed: {}", status);
                    }
                }
            }
            drop(publisher);
            schedule_repeating::<M, F>(weak, client, period, make);
        },
        period,
    );
}
