/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the public MQTT client and associated types necessary to invoke operations
on it.
 */

pub(crate) mod shared_impl;

use crate::client::shared_impl::*;
use crate::error::MqttResult;
use crate::mqtt::*;
use crate::mqtt::connack::ConnackPacket;
use crate::mqtt::disconnect::DisconnectPacket;
use crate::mqtt::puback::PubackPacket;
use crate::mqtt::pubcomp::PubcompPacket;
use crate::mqtt::publish::PublishPacket;
use crate::mqtt::suback::SubackPacket;
use crate::mqtt::subscribe::SubscribePacket;
use crate::mqtt::unsuback::UnsubackPacket;
use crate::mqtt::unsubscribe::UnsubscribePacket;
use crate::error::MqttError;
use crate::validate::validate_packet_outbound;

use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Additional options attached to a single publish operation.
#[derive(Debug, Default)]
pub struct PublishOptions {
    pub(crate) timeout: Option<Duration>,
}

/// A builder for publish operation options.
#[derive(Default)]
pub struct PublishOptionsBuilder {
    options: PublishOptions
}

impl PublishOptionsBuilder {

    /// Creates a new builder object with default options.
    pub fn new() -> Self {
        PublishOptionsBuilder {
            ..Default::default()
        }
    }

    /// Overrides the client-level ack timeout for this operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Builds a new PublishOptions object from the builder's configuration.
    pub fn build(self) -> PublishOptions {
        self.options
    }
}

/// Final result of a successful publish, by quality of service.
#[derive(Debug, Eq, PartialEq)]
pub enum PublishResponse {

    /// The publish was written to the transport; qos 0 offers nothing stronger
    Qos0,

    /// The broker acknowledged the publish
    Qos1(PubackPacket),

    /// The broker completed the two-phase delivery handshake
    Qos2(PubcompPacket),
}

impl Display for PublishResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishResponse::Qos0 => {
                write!(f, "PublishResponse Qos0")
            }
            PublishResponse::Qos1(puback) => {
                write!(f, "PublishResponse Qos1 ( {} )", puback)
            }
            PublishResponse::Qos2(pubcomp) => {
                write!(f, "PublishResponse Qos2 ( {} )", pubcomp)
            }
        }
    }
}

/// Result type for the final outcome of a publish operation
pub type PublishResult = MqttResult<PublishResponse>;

/// Return type of a publish operation
pub type PublishResultFuture = dyn Future<Output = PublishResult> + Send;

/// Additional options attached to a single subscribe operation.
#[derive(Debug, Default)]
pub struct SubscribeOptions {
    pub(crate) timeout: Option<Duration>,
}

/// A builder for subscribe operation options.
#[derive(Default)]
pub struct SubscribeOptionsBuilder {
    options: SubscribeOptions
}

impl SubscribeOptionsBuilder {

    /// Creates a new builder object with default options.
    pub fn new() -> Self {
        SubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Overrides the client-level ack timeout for this operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Builds a new SubscribeOptions object from the builder's configuration.
    pub fn build(self) -> SubscribeOptions {
        self.options
    }
}

/// Result type for the final outcome of a subscribe operation
pub type SubscribeResult = MqttResult<SubackPacket>;

/// Return type of a subscribe operation
pub type SubscribeResultFuture = dyn Future<Output = SubscribeResult> + Send;

/// Additional options attached to a single unsubscribe operation.
#[derive(Debug, Default)]
pub struct UnsubscribeOptions {
    pub(crate) timeout: Option<Duration>,
}

/// A builder for unsubscribe operation options.
#[derive(Default)]
pub struct UnsubscribeOptionsBuilder {
    options: UnsubscribeOptions
}

impl UnsubscribeOptionsBuilder {

    /// Creates a new builder object with default options.
    pub fn new() -> Self {
        UnsubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Overrides the client-level ack timeout for this operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Builds a new UnsubscribeOptions object from the builder's configuration.
    pub fn build(self) -> UnsubscribeOptions {
        self.options
    }
}

/// Result type for the final outcome of an unsubscribe operation
pub type UnsubscribeResult = MqttResult<UnsubackPacket>;

/// Return type of an unsubscribe operation
pub type UnsubscribeResultFuture = dyn Future<Output = UnsubscribeResult> + Send;

/// Additional options attached to a stop invocation.
#[derive(Debug, Default)]
pub struct StopOptions {
    pub(crate) disconnect: Option<DisconnectPacket>,
}

/// A builder for stop invocation options.
#[derive(Default)]
pub struct StopOptionsBuilder {
    options: StopOptions
}

impl StopOptionsBuilder {

    /// Creates a new builder object with default options.
    pub fn new() -> Self {
        StopOptionsBuilder {
            ..Default::default()
        }
    }

    /// Requests that a DISCONNECT packet be flushed to the broker before the connection is
    /// closed.
    pub fn with_disconnect_packet(mut self, disconnect: DisconnectPacket) -> Self {
        self.options.disconnect = Some(disconnect);
        self
    }

    /// Builds a new StopOptions object from the builder's configuration.
    pub fn build(self) -> StopOptions {
        self.options
    }
}

/// Settings established by a successful CONNECT/CONNACK exchange.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct NegotiatedSettings {

    /// Client id in use for the current connection
    pub client_id: String,

    /// Whether or not the client has rejoined an existing session.
    pub rejoined_session: bool,

    /// Keep alive interval, in seconds, in force for the current connection
    pub keep_alive_interval_seconds: u16,

    /// Wire protocol revision in force for the current connection
    pub protocol_version: ProtocolVersion,
}

impl Display for NegotiatedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NegotiatedSettings {{")?;
        writeln!(f, "  client_id: {}", self.client_id)?;
        writeln!(f, "  rejoined_session: {}", self.rejoined_session)?;
        writeln!(f, "  keep_alive_interval_seconds: {}", self.keep_alive_interval_seconds)?;
        writeln!(f, "  protocol_version: {}", self.protocol_version)?;
        write!(f, "}}")
    }
}

/// An event emitted every time the client begins a connection attempt to a candidate endpoint.
#[derive(Debug)]
pub struct ConnectionAttemptEvent {}

/// An event emitted when a connection attempt produces a successful CONNACK.
#[derive(Debug)]
pub struct ConnectionSuccessEvent {

    /// The successful CONNACK
    pub connack: ConnackPacket,

    /// Settings in force for the new connection
    pub settings: NegotiatedSettings,
}

/// An event emitted when a connection attempt fails before reaching a successful CONNACK.
#[derive(Debug)]
pub struct ConnectionFailureEvent {

    /// Error describing the failure
    pub error: MqttError,

    /// The failing CONNACK, when the broker explicitly rejected the attempt
    pub connack: Option<ConnackPacket>,
}

/// An event emitted when a previously-established connection is lost.
#[derive(Debug)]
pub struct DisconnectionEvent {

    /// Error describing why the connection ended
    pub error: MqttError,
}

/// An event emitted when the client settles into the stopped state.
#[derive(Debug)]
pub struct StoppedEvent {}

/// An event emitted every time an application message arrives from the broker.
#[derive(Debug)]
pub struct PublishReceivedEvent {

    /// The arrived message
    pub publish: PublishPacket,
}

/// Union of all events emitted by the client to its listeners.
#[derive(Debug)]
pub enum ClientEvent {
    ConnectionAttempt(ConnectionAttemptEvent),
    ConnectionSuccess(ConnectionSuccessEvent),
    ConnectionFailure(ConnectionFailureEvent),
    Disconnection(DisconnectionEvent),
    Stopped(StoppedEvent),
    PublishReceived(PublishReceivedEvent),
}

impl Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::ConnectionAttempt(_) => { write!(f, "ConnectionAttempt") }
            ClientEvent::ConnectionSuccess(event) => { write!(f, "ConnectionSuccess ( {} )", event.connack) }
            ClientEvent::ConnectionFailure(event) => { write!(f, "ConnectionFailure ( {} )", event.error) }
            ClientEvent::Disconnection(event) => { write!(f, "Disconnection ( {} )", event.error) }
            ClientEvent::Stopped(_) => { write!(f, "Stopped") }
            ClientEvent::PublishReceived(event) => { write!(f, "PublishReceived ( {} )", event.publish) }
        }
    }
}

/// Signature for client event listener callbacks
pub type ClientEventListenerCallback = dyn Fn(Arc<ClientEvent>) + Send + Sync;

/// Destination for client events.
pub enum ClientEventListener {

    /// Invoke a callback for every event
    Callback(Arc<ClientEventListenerCallback>)
}

impl Debug for ClientEventListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientEventListener::Callback(_) => {
                write!(f, "ClientEventListener::Callback(...)")
            }
        }
    }
}

/// Opaque handle used to remove a previously-registered event listener.
#[derive(Debug, Eq, PartialEq)]
pub struct ListenerHandle {
    pub(crate) id: u64
}

macro_rules! submit_async_client_operation {
    ($self:ident, $operation_type:ident, $options_internal_type: ident, $options_value: expr, $packet_value: expr) => ({

        let (response_sender, rx) = tokio::sync::oneshot::channel();
        let internal_options = $options_internal_type {
            options : $options_value.unwrap_or_default(),
            response_sender : Some(response_sender)
        };
        let send_result = $self.user_state.try_send(OperationOptions::$operation_type($packet_value, internal_options));
        Box::pin(async move {
            match send_result {
                Err(error) => {
                    Err(error)
                }
                _ => {
                    rx.await?
                }
            }
        })
    })
}

/// An asynchronous MQTT 3.1/3.1.1 client.
///
/// The client runs as an event loop task on a tokio runtime; this handle submits operations to
/// it over a channel.  All operations are queue-and-forward: they complete (through the
/// returned future) when the matching ack arrives, the operation's timeout elapses, or the
/// connection fails.
pub struct MqttClient {
    pub(crate) user_state: UserRuntimeState,

    pub(crate) listener_id_allocator: Mutex<u64>,
}

impl MqttClient {

    /// Signals the client that it should attempt to establish (and afterwards maintain) a
    /// connection using its configured candidate endpoints.
    pub fn start(&self) -> MqttResult<()> {
        log::info!("client start invoked");
        self.user_state.try_send(OperationOptions::Start())
    }

    /// Signals the client that it should close any current connection and enter the stopped
    /// state.  Optionally flushes a DISCONNECT packet first.
    pub fn stop(&self, options: Option<StopOptions>) -> MqttResult<()> {
        log::info!("client stop invoked");
        let options = options.unwrap_or_default();

        let mut stop_options_internal = StopOptionsInternal {
            ..Default::default()
        };

        if let Some(disconnect) = options.disconnect {
            stop_options_internal.disconnect = Some(Box::new(MqttPacket::Disconnect(disconnect)));
        }

        self.user_state.try_send(OperationOptions::Stop(stop_options_internal))
    }

    /// Signals the client that it should clean up all internal resources (connection,
    /// channels, runtime tasks) and enter a terminal state that cannot be escaped.
    pub fn close(&self) -> MqttResult<()> {
        log::info!("client close invoked; no further operations allowed");
        self.user_state.try_send(OperationOptions::Shutdown())
    }

    /// Submits a publish operation to the client's operation queue.  The publish is sent once
    /// it reaches the head of the queue and the client is connected.
    pub fn publish(&self, packet: PublishPacket, options: Option<PublishOptions>) -> Pin<Box<PublishResultFuture>> {
        log::debug!("publish operation submitted");
        let boxed_packet = Box::new(MqttPacket::Publish(packet));
        if let Err(error) = validate_packet_outbound(&boxed_packet) {
            return Box::pin(async move { Err(error) });
        }

        submit_async_client_operation!(self, Publish, PublishOptionsInternal, options, boxed_packet)
    }

    /// Submits a subscribe operation to the client's operation queue.  The subscribe is sent
    /// once it reaches the head of the queue and the client is connected.
    pub fn subscribe(&self, packet: SubscribePacket, options: Option<SubscribeOptions>) -> Pin<Box<SubscribeResultFuture>> {
        log::debug!("subscribe operation submitted");
        let boxed_packet = Box::new(MqttPacket::Subscribe(packet));
        if let Err(error) = validate_packet_outbound(&boxed_packet) {
            return Box::pin(async move { Err(error) });
        }

        submit_async_client_operation!(self, Subscribe, SubscribeOptionsInternal, options, boxed_packet)
    }

    /// Submits an unsubscribe operation to the client's operation queue.  The unsubscribe is
    /// sent once it reaches the head of the queue and the client is connected.
    pub fn unsubscribe(&self, packet: UnsubscribePacket, options: Option<UnsubscribeOptions>) -> Pin<Box<UnsubscribeResultFuture>> {
        log::debug!("unsubscribe operation submitted");
        let boxed_packet = Box::new(MqttPacket::Unsubscribe(packet));
        if let Err(error) = validate_packet_outbound(&boxed_packet) {
            return Box::pin(async move { Err(error) });
        }

        submit_async_client_operation!(self, Unsubscribe, UnsubscribeOptionsInternal, options, boxed_packet)
    }

    /// Adds an additional listener to the events emitted by this client.  Useful when multiple
    /// higher-level constructs share the same MQTT client.
    pub fn add_event_listener(&self, listener: ClientEventListener) -> MqttResult<ListenerHandle> {
        log::debug!("add_event_listener operation submitted");
        let mut current_id = self.listener_id_allocator.lock().unwrap();
        let listener_id = *current_id;
        *current_id += 1;

        self.user_state.try_send(OperationOptions::AddListener(listener_id, listener))?;

        Ok(ListenerHandle {
            id: listener_id
        })
    }

    /// Removes a listener from this client's set of event listeners.
    pub fn remove_event_listener(&self, listener: ListenerHandle) -> MqttResult<()> {
        log::debug!("remove_event_listener operation submitted");
        self.user_state.try_send(OperationOptions::RemoveListener(listener.id))
    }
}
