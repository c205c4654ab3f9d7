// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic subscriber.
//!
//! A subscription goes through the Master once; afterwards the subscriber
//! follows the topic on its own. When the publisher goes away it drops back
//! to pending and re-attaches as soon as the Master negotiates the topic
//! again. Transport trouble is reported through `on_message_error` and
//! retried; only a registration failure ends the subscription.

use super::message::Message;
use super::TopicState;
use crate::channel::{ChannelDescriptor, NegotiatedChannel};
use crate::master::client::{Role, WatchKey};
use crate::master::{MasterClient, MasterRequest, MasterResponse, Notification};
use crate::node::{NodeId, NodeIdentity};
use crate::status::Status;
use crate::transport::{LinkEvent, SubscriberLink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

type ResultCallback = Box<dyn FnOnce(Status) + Send>;

struct Callbacks<M> {
    on_message: Mutex<Box<dyn FnMut(M) + Send>>,
    on_error: Mutex<Box<dyn FnMut(Status) + Send>>,
}

impl<M> Callbacks<M> {
    fn message(&self, message: M) {
        (self.on_message.lock())(message);
    }

    fn error(&self, status: Status) {
        (self.on_error.lock())(status);
    }
}

struct Registration {
    node_id: NodeId,
    topic: String,
}

struct SubState<M> {
    state: TopicState,
    registration: Option<Registration>,
    descriptor: ChannelDescriptor,
    channel: Option<NegotiatedChannel>,
    link: Option<SubscriberLink>,
    /// Bumped on subscribe and teardown.
    epoch: u64,
    /// Bumped whenever the link is replaced or dropped.
    link_gen: u64,
    failure_reported: bool,
    reconnects_left: u32,
    pending_result: Option<ResultCallback>,
    callbacks: Option<Arc<Callbacks<M>>>,
    backlog: VecDeque<M>,
    draining: bool,
}

impl<M> SubState<M> {
    fn drop_link(&mut self) {
        self.link_gen += 1;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn teardown(&mut self, next: TopicState) -> Option<Registration> {
        self.epoch += 1;
        self.drop_link();
        self.state = next;
        self.channel = None;
        self.backlog.clear();
        self.registration.take()
    }
}

struct SubInner<M: Message> {
    client: MasterClient,
    state: Mutex<SubState<M>>,
}

impl<M: Message> SubInner<M> {
    fn forget(&self, reg: &Registration) {
        self.client.release(reg.node_id, &reg.topic, Role::Subscriber);
        self.client
            .unwatch(reg.node_id, &WatchKey::Topic(reg.topic.clone()));
    }

    fn unsubscribe_at_master<F>(&self, reg: Registration, on_reply: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        self.forget(&reg);
        self.client.call(
            MasterRequest::UnsubscribeTopic {
                node_id: reg.node_id,
                topic: reg.topic,
            },
            move |result| on_reply(result.err().unwrap_or_else(Status::ok_status)),
        );
    }

    fn finish_subscribe(self: &Arc<Self>, epoch: u64, result: Result<MasterResponse, Status>) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        match result {
            Ok(MasterResponse::TopicSubscribed { channel: Some(channel) }) => {
                let pending = state.pending_result.take();
                drop(state);
                if let Some(on_result) = pending {
                    on_result(Status::ok_status());
                }
                self.attach(channel);
            }
            Ok(MasterResponse::TopicSubscribed { channel: None }) => {
                if let Some(reg) = &state.registration {
                    log::debug!("[subscriber] '{}' waits for a publisher", reg.topic);
                }
            }
            Ok(other) => {
                let status = Status::internal(format!("unexpected reply to subscribe_topic: {:?}", other));
                let pending = state.pending_result.take();
                let reg = state.teardown(TopicState::Failed);
                drop(state);
                if let Some(reg) = reg {
                    self.unsubscribe_at_master(reg, |_| {});
                }
                if let Some(on_result) = pending {
                    on_result(status);
                }
            }
            Err(status) => {
                let pending = state.pending_result.take();
                let reg = state.teardown(TopicState::Failed);
                drop(state);
                if let Some(reg) = reg {
                    log::warn!("[subscriber] subscribing to '{}' failed: {}", reg.topic, status);
                    self.forget(&reg);
                }
                if let Some(on_result) = pending {
                    on_result(status);
                }
            }
        }
    }

    fn on_notification(self: &Arc<Self>, notification: Notification) {
        match notification {
            Notification::TopicNegotiated { channel, .. } => {
                let pending = {
                    let mut state = self.state.lock();
                    if !state.state.is_active() {
                        return;
                    }
                    state.pending_result.take()
                };
                if let Some(on_result) = pending {
                    on_result(Status::ok_status());
                }
                self.attach(channel);
            }
            Notification::TopicFailed { topic, status, .. } => {
                let on_result = {
                    let mut state = self.state.lock();
                    if !state.state.is_active() {
                        return;
                    }
                    // A subscription that already reported its result is
                    // never failed by a later publisher; it keeps waiting.
                    let Some(on_result) = state.pending_result.take() else {
                        log::debug!("[subscriber] '{}' keeps waiting: {}", topic, status);
                        return;
                    };
                    if let Some(reg) = state.teardown(TopicState::Failed) {
                        log::warn!("[subscriber] '{}' failed: {}", reg.topic, status);
                        self.forget(&reg);
                    }
                    on_result
                };
                on_result(status);
            }
            Notification::TopicClosed { topic, .. } => {
                let (reported, callbacks) = {
                    let mut state = self.state.lock();
                    if state.state != TopicState::Negotiated {
                        return;
                    }
                    state.drop_link();
                    state.state = TopicState::Pending;
                    state.channel = None;
                    state.backlog.clear();
                    let reported = std::mem::take(&mut state.failure_reported);
                    (reported, state.callbacks.clone())
                };
                log::info!("[subscriber] publisher of '{}' went away", topic);
                if let (false, Some(callbacks)) = (reported, callbacks) {
                    callbacks.error(Status::transport_failure(format!(
                        "publisher of '{}' closed the channel",
                        topic
                    )));
                }
            }
            Notification::ServiceAvailable { .. } | Notification::ServiceUnavailable { .. } => {}
        }
    }

    /// Open a link to `channel`, replacing any previous one.
    fn attach(self: &Arc<Self>, channel: NegotiatedChannel) {
        let mut state = self.state.lock();
        if !state.state.is_active() {
            return;
        }
        state.drop_link();
        let generation = state.link_gen;
        state.state = TopicState::Negotiated;
        state.failure_reported = false;

        let weak = Arc::downgrade(self);
        let handle = self.client.handle().clone();
        let sink = Arc::new(move |event: LinkEvent| {
            let weak = weak.clone();
            handle.post_task(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_link_event(generation, event);
                }
            });
        });
        match SubscriberLink::connect(&channel, &state.descriptor, self.client.config(), sink) {
            Ok(link) => {
                log::debug!("[subscriber] attaching to {}", link.endpoint());
                state.link = Some(link);
            }
            Err(e) => {
                let status: Status = e.into();
                let weak = Arc::downgrade(self);
                self.client.handle().post_task(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_link_event(generation, LinkEvent::Failed(status));
                    }
                });
            }
        }
        state.channel = Some(channel);

        if let Some(period) = state.descriptor.period() {
            if !state.draining {
                state.draining = true;
                schedule_drain(Arc::downgrade(self), self.client.clone(), period);
            }
        }
    }

    fn on_link_event(self: &Arc<Self>, generation: u64, event: LinkEvent) {
        let mut state = self.state.lock();
        if state.link_gen != generation || state.state != TopicState::Negotiated {
            return;
        }
        let Some(callbacks) = state.callbacks.clone() else {
            return;
        };
        match event {
            LinkEvent::Frame(bytes) => {
                state.reconnects_left = self.client.config().reconnect_attempts;
                match M::decode(&bytes) {
                    Ok(message) if state.descriptor.period().is_some() => {
                        let limit = state.descriptor.queue_size();
                        while state.backlog.len() >= limit {
                            state.backlog.pop_front();
                        }
                        state.backlog.push_back(message);
                    }
                    Ok(message) => {
                        drop(state);
                        callbacks.message(message);
                    }
                    Err(status) => {
                        drop(state);
                        callbacks.error(Status::transport_failure(format!(
                            "malformed frame: {}",
                            status.error_message()
                        )));
                    }
                }
            }
            LinkEvent::Failed(status) => {
                if state.failure_reported {
                    return;
                }
                state.failure_reported = true;
                if let Some(mut link) = state.link.take() {
                    link.close();
                }
                if state.reconnects_left > 0 {
                    state.reconnects_left -= 1;
                    let weak = Arc::downgrade(self);
                    self.client.handle().post_delayed_task(
                        move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.reconnect(generation);
                            }
                        },
                        self.client.config().reconnect_delay(),
                    );
                } else {
                    log::warn!("[subscriber] giving up on the channel until the topic is renegotiated");
                }
                drop(state);
                callbacks.error(status);
            }
        }
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let channel = {
            let state = self.state.lock();
            if state.link_gen != generation || state.state != TopicState::Negotiated {
                return;
            }
            state.channel.clone()
        };
        if let Some(channel) = channel {
            log::debug!("[subscriber] reconnecting to {}", channel.endpoint);
            self.attach(channel);
        }
    }
}

impl<M: Message> Drop for SubInner<M> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.state.is_active() {
            if let Some(reg) = state.teardown(TopicState::Unregistered) {
                self.unsubscribe_at_master(reg, |_| {});
            }
        }
    }
}

fn schedule_drain<M: Message>(weak: Weak<SubInner<M>>, client: MasterClient, period: Duration) {
    let handle = client.handle().clone();
    handle.post_delayed_task(
        move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (next, callbacks) = {
                let mut state = inner.state.lock();
                if !state.state.is_active() {
                    state.draining = false;
                    return;
                }
                (state.backlog.pop_front(), state.callbacks.clone())
            };
            if let (Some(message), Some(callbacks)) = (next, callbacks) {
                callbacks.message(message);
            }
            drop(inner);
            schedule_drain(weak, client, period);
        },
        period,
    );
}

/// Receiving end of one topic.
pub struct Subscriber<M: Message> {
    inner: Arc<SubInner<M>>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> Clone for Subscriber<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: Message> Subscriber<M> {
    pub fn new(client: &MasterClient) -> Self {
        Self {
            inner: Arc::new(SubInner {
                client: client.clone(),
                state: Mutex::new(SubState {
                    state: TopicState::Unregistered,
                    registration: None,
                    descriptor: ChannelDescriptor::default(),
                    channel: None,
                    link: None,
                    epoch: 0,
                    link_gen: 0,
                    failure_reported: false,
                    reconnects_left: 0,
                    pending_result: None,
                    callbacks: None,
                    backlog: VecDeque::new(),
                    draining: false,
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

    pub fn topic(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .registration
            .as_ref()
            .map(|r| r.topic.clone())
    }

    pub fn channel(&self) -> Option<NegotiatedChannel> {
        self.inner.state.lock().channel.clone()
    }

    /// Subscribe to `topic`.
    ///
    /// `on_result` fires once: with success when a channel is negotiated
    /// (immediately if a publisher exists, otherwise when one appears), or
    /// with the registration failure. `on_message` then runs for every
    /// decoded payload. `on_message_error` reports transport trouble on a
    /// registered subscription and never replaces `on_result`.
    pub fn request_subscribe<F, E, R>(
        &self,
        identity: &NodeIdentity,
        topic: &str,
        on_message: F,
        on_message_error: E,
        descriptor: ChannelDescriptor,
        on_result: R,
    ) where
        F: FnMut(M) + Send + 'static,
        E: FnMut(Status) + Send + 'static,
        R: FnOnce(Status) + Send + 'static,
    {
        let client = &self.inner.client;
        if self.state().is_active() {
            let status = Status::already_exists(format!(
                "subscriber is already registered for '{}'",
                self.topic().unwrap_or_default()
            ));
            client.handle().post_task(move || on_result(status));
            return;
        }
        if let Err(status) = client.claim(identity.id, topic, Role::Subscriber) {
            client.handle().post_task(move || on_result(status));
            return;
        }

        let wire = descriptor.to_wire();
        let epoch = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.state = TopicState::Pending;
            state.registration = Some(Registration {
                node_id: identity.id,
                topic: topic.to_string(),
            });
            state.descriptor = descriptor;
            state.channel = None;
            state.failure_reported = false;
            state.reconnects_left = client.config().reconnect_attempts;
            state.pending_result = Some(Box::new(on_result));
            state.callbacks = Some(Arc::new(Callbacks {
                on_message: Mutex::new(Box::new(on_message)),
                on_error: Mutex::new(Box::new(on_message_error)),
            }));
            state.epoch
        };

        let weak = Arc::downgrade(&self.inner);
        client.watch(
            identity.id,
            WatchKey::Topic(topic.to_string()),
            Arc::new(move |notification| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_notification(notification);
                }
            }),
        );

        log::debug!("[subscriber] requesting '{}' for {}", topic, identity);
        let request = MasterRequest::SubscribeTopic {
            node_id: identity.id,
            topic: topic.to_string(),
            schema_id: M::schema_id(),
            descriptor: wire,
        };
        let weak = Arc::downgrade(&self.inner);
        client.call(request, move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.finish_subscribe(epoch, result);
            }
        });
    }

    /// Drop the channel and unregister at the Master. Idempotent.
    ///
    /// A subscription still waiting for a publisher has its `on_result`
    /// fired with `Unregistered` first.
    pub fn request_unsubscribe<F>(&self, identity: &NodeIdentity, topic: &str, on_result: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let (reg, pending) = {
            let mut state = self.inner.state.lock();
            let matches = state
                .registration
                .as_ref()
                .is_some_and(|r| r.node_id == identity.id && r.topic == topic);
            if matches && state.state.is_active() {
                (state.teardown(TopicState::Unregistered), state.pending_result.take())
            } else {
                (None, None)
            }
        };
        let handle = self.inner.client.handle();
        if let Some(pending) = pending {
            handle.post_task(move || {
                pending(Status::unregistered("unsubscribed before a publisher was negotiated"))
            });
        }
        match reg {
            Some(reg) => {
                log::debug!("[subscriber] unsubscribing '{}' for {}", reg.topic, identity);
                self.inner.unsubscribe_at_master(reg, on_result);
            }
            None => handle.post_task(move || on_result(Status::ok_status())),
        }
    }
}
