/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::client::*;
use crate::config::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::mqtt::connack::ConnackPacket;
use crate::protocol::*;

use log::*;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

pub(crate) struct PublishOptionsInternal {
    pub options: PublishOptions,
    pub response_sender: Option<oneshot::Sender<PublishResult>>,
}

pub(crate) struct SubscribeOptionsInternal {
    pub options: SubscribeOptions,
    pub response_sender: Option<oneshot::Sender<SubscribeResult>>,
}

pub(crate) struct UnsubscribeOptionsInternal {
    pub options: UnsubscribeOptions,
    pub response_sender: Option<oneshot::Sender<UnsubscribeResult>>,
}

#[derive(Default)]
pub(crate) struct StopOptionsInternal {
    pub disconnect: Option<Box<MqttPacket>>,
}

pub(crate) enum OperationOptions {
    Publish(Box<MqttPacket>, PublishOptionsInternal),
    Subscribe(Box<MqttPacket>, SubscribeOptionsInternal),
    Unsubscribe(Box<MqttPacket>, UnsubscribeOptionsInternal),
    Start(),
    Stop(StopOptionsInternal),
    Shutdown(),
    AddListener(u64, ClientEventListener),
    RemoveListener(u64)
}

pub(crate) struct UserRuntimeState {
    pub(crate) operation_sender: UnboundedSender<OperationOptions>
}

impl UserRuntimeState {
    pub(crate) fn try_send(&self, operation_options: OperationOptions) -> MqttResult<()> {
        if self.operation_sender.send(operation_options).is_err() {
            return Err(MqttError::new_operation_channel_failure("failed to submit operation to client channel"));
        }

        Ok(())
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub(crate) enum ClientImplState {
    Stopped,
    Connecting,
    Connected,
    PendingReconnect,
    Shutdown,
}

impl Display for ClientImplState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientImplState::Stopped => { write!(f, "Stopped") }
            ClientImplState::Connecting => { write!(f, "Connecting") }
            ClientImplState::Connected => { write!(f, "Connected") }
            ClientImplState::PendingReconnect => { write!(f, "PendingReconnect") }
            ClientImplState::Shutdown => { write!(f, "Shutdown") }
        }
    }
}

pub(crate) struct MqttClientImpl {
    protocol_state: ProtocolState,
    listeners: HashMap<u64, ClientEventListener>,

    current_state: ClientImplState,
    desired_state: ClientImplState,

    desired_stop_options: Option<StopOptionsInternal>,

    packet_events: VecDeque<PacketEvent>,

    last_connack: Option<ConnackPacket>,
    last_error: Option<MqttError>,

    // candidate endpoint failover state
    endpoints: Vec<Endpoint>,
    endpoint_index: usize,

    // version fallback bookkeeping; a defaulted 3.1.1 configuration gets one full pass over
    // the candidate list as 3.1 if no endpoint ever produces a CONNACK
    protocol_version_explicit: bool,
    version_fallback_applied: bool,
    has_connected: bool,

    successful_connect_time: Option<Instant>,
    next_reconnect_period: Duration,
    reconnect_options: ReconnectOptions,

    connect_timeout: Duration,
}

impl MqttClientImpl {

    pub(crate) fn new(mut client_config: MqttClientOptions, connect_config: ConnectOptions) -> MqttResult<Self> {
        debug!("Creating new MQTT client - client options: {:?}", client_config);
        debug!("Creating new MQTT client - connect options: {:?}", connect_config);

        let default_listener = client_config.default_event_listener.take();

        let endpoints = client_config.endpoints.clone();
        let protocol_version_explicit = connect_config.protocol_version_explicit;

        let state_config = ProtocolStateConfig {
            connect_options: connect_config,
            base_timestamp: Instant::now(),
            ack_timeout: client_config.ack_timeout,
            session_store: client_config.session_store.take(),
            session_endpoint: endpoints[0].clone(),
        };

        let mut reconnect_options = client_config.reconnect_options;
        reconnect_options.normalize();

        let mut client_impl = MqttClientImpl {
            protocol_state: ProtocolState::new(state_config)?,
            listeners: HashMap::new(),
            current_state: ClientImplState::Stopped,
            desired_state: ClientImplState::Stopped,
            desired_stop_options: None,
            packet_events: VecDeque::new(),
            last_connack: None,
            last_error: None,
            endpoints,
            endpoint_index: 0,
            protocol_version_explicit,
            version_fallback_applied: false,
            has_connected: false,
            successful_connect_time: None,
            next_reconnect_period: reconnect_options.base_reconnect_period,
            reconnect_options,
            connect_timeout: client_config.connect_timeout,
        };

        if let Some(listener) = default_listener {
            client_impl.listeners.insert(0, listener);
        }

        Ok(client_impl)
    }

    pub(crate) fn connect_timeout(&self) -> &Duration {
        &self.connect_timeout
    }

    pub(crate) fn get_current_state(&self) -> ClientImplState {
        self.current_state
    }

    pub(crate) fn get_protocol_state(&self) -> ProtocolStateType {
        self.protocol_state.state()
    }

    pub(crate) fn current_endpoint(&self) -> Endpoint {
        self.endpoints[self.endpoint_index.min(self.endpoints.len() - 1)].clone()
    }

    pub(crate) fn ws_protocol_version(&self) -> ProtocolVersion {
        self.protocol_state.current_protocol_version()
    }

    pub(crate) fn add_listener(&mut self, id: u64, listener: ClientEventListener) {
        self.listeners.insert(id, listener);
    }

    pub(crate) fn remove_listener(&mut self, id: u64) {
        self.listeners.remove(&id);
    }

    pub(crate) fn broadcast_event(&self, event: Arc<ClientEvent>) {
        debug!("Broadcasting client event: {}", *event);

        for listener in self.listeners.values() {
            match listener {
                ClientEventListener::Callback(callback) => {
                    crate::features::tokio_ws::spawn_event_callback(event.clone(), callback.clone());
                }
            }
        }
    }

    pub(crate) fn apply_error(&mut self, error: MqttError) {
        debug!("Applying error to client: {}", error);

        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
    }

    pub(crate) fn handle_incoming_operation(&mut self, operation: OperationOptions) {
        match operation {
            OperationOptions::Publish(packet, internal_options) => {
                debug!("Submitting publish operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Publish(packet, internal_options),
                    current_time: Instant::now()
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Subscribe(packet, internal_options) => {
                debug!("Submitting subscribe operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Subscribe(packet, internal_options),
                    current_time: Instant::now()
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Unsubscribe(packet, internal_options) => {
                debug!("Submitting unsubscribe operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Unsubscribe(packet, internal_options),
                    current_time: Instant::now()
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Start() => {
                debug!("Updating desired state to Connected");
                self.desired_stop_options = None;
                self.endpoint_index = 0;
                self.version_fallback_applied = false;
                self.desired_state = ClientImplState::Connected;
            }
            OperationOptions::Stop(mut options) => {
                if is_connection_established(self.protocol_state.state()) {
                    if let Some(disconnect) = &options.disconnect {
                        debug!("Submitting disconnect operation to protocol state");
                        let disconnect_context = UserEventContext {
                            event: UserEvent::Disconnect(disconnect.clone()),
                            current_time: Instant::now()
                        };

                        self.protocol_state.handle_user_event(disconnect_context);
                    }
                } else {
                    // nothing to flush when no MQTT connection is established
                    options.disconnect = None;
                }

                debug!("Updating desired state to Stopped");
                self.desired_stop_options = Some(options);
                self.desired_state = ClientImplState::Stopped;
            }
            OperationOptions::Shutdown() => {
                debug!("Updating desired state to Shutdown");
                self.protocol_state.reset(&Instant::now());
                self.desired_state = ClientImplState::Shutdown;
            }
            OperationOptions::AddListener(id, listener) => {
                debug!("Adding listener {} to client events", id);
                self.add_listener(id, listener);
            }
            OperationOptions::RemoveListener(id) => {
                debug!("Removing listener {} from client events", id);
                self.remove_listener(id);
            }
        }
    }

    fn dispatch_packet_events(&mut self) {
        let mut events = VecDeque::new();
        mem::swap(&mut events, &mut self.packet_events);

        for event in events {
            match event {
                PacketEvent::Publish(publish) => {
                    debug!("dispatch_packet_events - publish packet");
                    let publish_event = PublishReceivedEvent {
                        publish,
                    };

                    self.broadcast_event(Arc::new(ClientEvent::PublishReceived(publish_event)));
                }
                PacketEvent::Connack(connack) => {
                    debug!("dispatch_packet_events - connack packet");
                    let return_code = connack.return_code;
                    self.last_connack = Some(connack);
                    if return_code == ConnectReturnCode::Accepted {
                        self.has_connected = true;
                        self.successful_connect_time = Some(Instant::now());

                        // a successful connack ends the candidate endpoint search
                        self.endpoint_index = self.endpoints.len() - 1;

                        self.emit_connection_success_event();
                    }
                }
            }
        }
    }

    pub(crate) fn handle_incoming_bytes(&mut self, bytes: &[u8]) -> MqttResult<()> {
        debug!("client impl - handle_incoming_bytes: {} bytes", bytes.len());
        let mut context = NetworkEventContext {
            event: NetworkEvent::IncomingData(bytes),
            current_time: Instant::now(),
            packet_events: &mut self.packet_events
        };

        let result = self.protocol_state.handle_network_event(&mut context);
        self.dispatch_packet_events();

        match result {
            Err(error) => {
                self.apply_error(error); // this error propagates
                Err(MqttError::new_internal_state_error("unseen")) // this error does not propagate
            }
            _ => { Ok(()) }
        }
    }

    pub(crate) fn handle_write_completion(&mut self) -> MqttResult<()> {
        debug!("client impl - handle_write_completion");
        let mut context = NetworkEventContext {
            event: NetworkEvent::WriteCompletion,
            current_time: Instant::now(),
            packet_events: &mut self.packet_events
        };

        let result = self.protocol_state.handle_network_event(&mut context);

        match result {
            Err(error) => {
                self.apply_error(error); // this error propagates
                Err(MqttError::new_internal_state_error("unseen")) // this error does not propagate
            }
            _ => { Ok(()) }
        }
    }

    pub(crate) fn handle_service(&mut self, outbound_data: &mut Vec<u8>) -> MqttResult<()> {
        let mut context = ServiceContext {
            to_socket: outbound_data,
            current_time: Instant::now(),
        };

        let result = self.protocol_state.service(&mut context);

        match result {
            Err(error) => {
                self.apply_error(error); // this error propagates
                Err(MqttError::new_internal_state_error("unseen")) // this error does not propagate
            }
            _ => { Ok(()) }
        }
    }

    fn clamp_reconnect_period(&self, mut reconnect_period: Duration) -> Duration {
        if reconnect_period > self.reconnect_options.max_reconnect_period {
            reconnect_period = self.reconnect_options.max_reconnect_period;
        }

        reconnect_period
    }

    fn compute_uniform_jitter_period(&self, max_nanos: u128) -> Duration {
        let mut rng = rand::thread_rng();
        let uniform_nanos = rng.gen_range(0..max_nanos);
        Duration::from_nanos(uniform_nanos as u64)
    }

    pub(crate) fn advance_reconnect_period(&mut self) -> Duration {
        let reconnect_period = self.next_reconnect_period;
        self.next_reconnect_period = self.clamp_reconnect_period(self.next_reconnect_period * 2);

        match self.reconnect_options.reconnect_period_jitter {
            ExponentialBackoffJitterType::None => {
                reconnect_period
            }
            ExponentialBackoffJitterType::Uniform => {
                self.compute_uniform_jitter_period(reconnect_period.as_nanos().max(1))
            }
        }
    }

    // Decides what a connection failure leads to: the next candidate endpoint, one protocol
    // version fallback pass over the whole list, or giving up.
    fn apply_reconnect_policy(&mut self) -> ClientImplState {
        self.endpoint_index += 1;
        if self.endpoint_index < self.endpoints.len() {
            info!("client impl - advancing to candidate endpoint {}", self.endpoint_index);
            return ClientImplState::PendingReconnect;
        }

        if !self.has_connected
            && !self.protocol_version_explicit
            && !self.version_fallback_applied
            && self.protocol_state.current_protocol_version() == ProtocolVersion::Mqtt311 {
            info!("client impl - no endpoint produced a CONNACK speaking 3.1.1; retrying the candidate list as 3.1");
            self.version_fallback_applied = true;
            self.endpoint_index = 0;
            self.protocol_state.set_protocol_version(ProtocolVersion::Mqtt31);
            return ClientImplState::PendingReconnect;
        }

        ClientImplState::Stopped
    }

    pub(crate) fn compute_optional_state_transition(&self) -> Option<ClientImplState> {
        match self.current_state {
            ClientImplState::Stopped => {
                match self.desired_state {
                    ClientImplState::Connected => {
                        return Some(ClientImplState::Connecting)
                    }
                    ClientImplState::Shutdown => {
                        return Some(ClientImplState::Shutdown)
                    }
                    _ => {}
                }
            }

            ClientImplState::Connecting | ClientImplState::PendingReconnect => {
                if self.desired_state != ClientImplState::Connected {
                    return Some(ClientImplState::Stopped)
                }
            }

            ClientImplState::Connected => {
                if self.desired_state != ClientImplState::Connected {
                    if let Some(stop_options) = &self.desired_stop_options {
                        if stop_options.disconnect.is_none() {
                            return Some(ClientImplState::Stopped);
                        }
                    } else {
                        return Some(ClientImplState::Stopped);
                    }
                }
            }

            _ => { }
        }

        None
    }

    pub(crate) fn get_next_connected_service_time(&mut self) -> Option<Instant> {
        if self.current_state == ClientImplState::Connected {
            return self.protocol_state.get_next_service_timepoint(&Instant::now());
        }

        None
    }

    fn emit_connection_attempt_event(&self) {
        self.broadcast_event(Arc::new(ClientEvent::ConnectionAttempt(ConnectionAttemptEvent {})));
    }

    fn emit_connection_success_event(&self) {
        let settings = self.protocol_state.get_negotiated_settings().as_ref().unwrap();

        let connection_success_event = ConnectionSuccessEvent {
            connack: self.last_connack.as_ref().unwrap().clone(),
            settings: settings.clone(),
        };

        self.broadcast_event(Arc::new(ClientEvent::ConnectionSuccess(connection_success_event)));
    }

    fn emit_connection_failure_event(&mut self) {
        let mut connection_failure_event = ConnectionFailureEvent {
            error: self.last_error.take().unwrap_or(MqttError::new_connection_establishment_failure("unknown failure source")),
            connack: None,
        };

        if let Some(connack) = &self.last_connack {
            connection_failure_event.connack = Some(connack.clone());
        }

        self.broadcast_event(Arc::new(ClientEvent::ConnectionFailure(connection_failure_event)));
    }

    fn emit_disconnection_event(&mut self) {
        let disconnection_event = DisconnectionEvent {
            error: self.last_error.take().unwrap_or(MqttError::new_connection_closed("disconnection with no source error")),
        };

        self.broadcast_event(Arc::new(ClientEvent::Disconnection(disconnection_event)));
    }

    fn emit_stopped_event(&self) {
        self.broadcast_event(Arc::new(ClientEvent::Stopped(StoppedEvent {})));
    }

    pub(crate) fn transition_to_state(&mut self, mut new_state: ClientImplState) -> MqttResult<()> {
        let old_state = self.current_state;
        if old_state == new_state {
            return Ok(());
        }

        if new_state == ClientImplState::PendingReconnect {
            if self.desired_state != ClientImplState::Connected {
                new_state = ClientImplState::Stopped;
            } else {
                new_state = self.apply_reconnect_policy();
            }
        }

        if new_state == ClientImplState::Stopped && self.desired_state == ClientImplState::Shutdown {
            new_state = ClientImplState::Shutdown;
        }

        debug!("client impl transition_to_state - old state: {}, new_state: {}", old_state, new_state);

        if new_state == ClientImplState::Connected {
            let mut connection_opened_context = NetworkEventContext {
                event: NetworkEvent::ConnectionOpened(ConnectionOpenedContext {
                    establishment_timeout: Instant::now() + self.connect_timeout,
                }),
                current_time: Instant::now(),
                packet_events: &mut self.packet_events
            };

            self.protocol_state.handle_network_event(&mut connection_opened_context)?;
        } else if old_state == ClientImplState::Connected {
            let mut connection_closed_context = NetworkEventContext {
                event: NetworkEvent::ConnectionClosed,
                current_time: Instant::now(),
                packet_events: &mut self.packet_events
            };

            self.protocol_state.handle_network_event(&mut connection_closed_context)?;
        }

        if new_state == ClientImplState::Connecting {
            self.last_error = None;
            self.last_connack = None;
            self.emit_connection_attempt_event();
        }

        if old_state == ClientImplState::Connecting && new_state != ClientImplState::Connected {
            self.emit_connection_failure_event();
        }

        if old_state == ClientImplState::Connected {
            if let Some(connack) = &self.last_connack {
                if connack.return_code == ConnectReturnCode::Accepted {
                    self.emit_disconnection_event();
                } else {
                    self.emit_connection_failure_event();
                }
            } else {
                self.emit_connection_failure_event();
            }

            if let Some(successful_connect_timepoint) = self.successful_connect_time {
                let now = Instant::now();
                if (now - successful_connect_timepoint) > self.reconnect_options.reconnect_stability_reset_period {
                    self.next_reconnect_period = self.reconnect_options.base_reconnect_period;
                }
            }

            self.successful_connect_time = None;
        }

        if new_state == ClientImplState::Stopped {
            self.desired_stop_options = None;
            self.emit_stopped_event();
        }

        self.current_state = new_state;

        Ok(())
    }
}
