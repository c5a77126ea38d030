/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

// Internal module that implements most of the MQTT 3.x spec with respect to client protocol
// behavior

use crate::client::*;
use crate::client::shared_impl::*;
use crate::config::*;
use crate::decode::*;
use crate::encode::*;
use crate::encode::utils::MAXIMUM_VARIABLE_LENGTH_INTEGER;
use crate::error::{fold_mqtt_result, MqttError, MqttResult};
use crate::keepalive::*;
use crate::mqtt::*;
use crate::mqtt::connack::*;
use crate::mqtt::connect::*;
use crate::mqtt::pingreq::*;
use crate::mqtt::puback::*;
use crate::mqtt::pubcomp::*;
use crate::mqtt::publish::*;
use crate::mqtt::pubrec::*;
use crate::mqtt::pubrel::*;
use crate::mqtt::utils::*;
use crate::session::*;
use crate::validate::*;

use log::*;

use std::cmp::{Ordering, Reverse};
use std::collections::*;
use std::fmt::{Display, Formatter};
use std::mem;
use std::time::{Duration, Instant};

pub(crate) enum ClientOperationOptions {
    Publish(PublishOptionsInternal),
    Subscribe(SubscribeOptionsInternal),
    Unsubscribe(UnsubscribeOptionsInternal),
}

// Data structure that tracks the state of an MQTT operation.  This includes both user-submitted
// operations and internally-generated ones.  Every outbound packet corresponds to an operation.
// This packet correspondence is 1-1 with the single exception of a pubrel being associated with
// a qos2 publish.
pub(crate) struct ClientOperation {

    // Every operation has a unique id, starting at 1.  Id allocation is serialized based on
    // time-of-submission, which is also what the durable session store's sequence numbers are
    // derived from.
    id: u64,

    // The base packet associated with this operation.
    pub(crate) packet: Box<MqttPacket>,

    // lets the same operation track both the original qos 2 publish and the followup pubrel
    pub(crate) qos2_pubrel: Option<Box<MqttPacket>>,

    // MQTT packet id that has been assigned to this operation.  Assignment is also reflected in
    // the packet itself.
    packet_id: Option<u16>,

    // Additional options (primarily the completion channel) for an operation
    options: Option<ClientOperationOptions>,
}

impl ClientOperation {
    pub fn bind_packet_id(&mut self, packet_id: u16) {
        self.packet_id = Some(packet_id);
        match &mut *self.packet {
            MqttPacket::Subscribe(subscribe) => {
                debug!("Subscribe operation {} binding to packet id {}", self.id, packet_id);
                subscribe.packet_id = packet_id;
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                debug!("Unsubscribe operation {} binding to packet id {}", self.id, packet_id);
                unsubscribe.packet_id = packet_id;
            }
            MqttPacket::Publish(publish) => {
                debug!("Publish operation {} binding to packet id {}", self.id, packet_id);
                publish.packet_id = packet_id;
            }
            _ => {
                panic!("Invalid packet type for packet id binding");
            }
        }
    }

    pub fn unbind_packet_id(&mut self) {
        self.packet_id = None;
        match &mut *self.packet {
            MqttPacket::Subscribe(subscribe) => {
                debug!("Subscribe operation {} unbinding packet id", self.id);
                subscribe.packet_id = 0;
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                debug!("Unsubscribe operation {} unbinding packet id", self.id);
                unsubscribe.packet_id = 0;
            }
            MqttPacket::Publish(publish) => {
                debug!("Publish operation {} unbinding packet id", self.id);
                publish.packet_id = 0;
            }
            _ => {
                panic!("Invalid packet type for packet id unbinding");
            }
        }
    }
}

// Most received packets stay internal or are routed to an operation's result channel.  Connack
// and Publish are surfaced to the user through the client.
#[derive(Debug)]
pub(crate) enum PacketEvent {
    Connack(ConnackPacket),
    Publish(PublishPacket),
}

pub(crate) struct ConnectionOpenedContext {
    pub(crate) establishment_timeout: Instant,
}

// The client's protocol state is completely uncoupled from networking data types.  We offer
// a simple interface that models and handles all relevant events.
pub(crate) enum NetworkEvent<'a> {
    ConnectionOpened(ConnectionOpenedContext),
    ConnectionClosed,
    IncomingData(&'a [u8]),
    WriteCompletion
}

pub(crate) struct NetworkEventContext<'a> {
    pub(crate) event: NetworkEvent<'a>,
    pub(crate) current_time: Instant,

    // output field for packets that the client is interested in
    pub(crate) packet_events: &'a mut VecDeque<PacketEvent>,
}

// The four actions users can take with respect to protocol state.  Start/stop is handled
// by the containing client.
pub(crate) enum UserEvent {
    Publish(Box<MqttPacket>, PublishOptionsInternal),
    Subscribe(Box<MqttPacket>, SubscribeOptionsInternal),
    Unsubscribe(Box<MqttPacket>, UnsubscribeOptionsInternal),
    Disconnect(Box<MqttPacket>)
}

pub(crate) struct UserEventContext {
    pub(crate) event: UserEvent,
    pub(crate) current_time: Instant,
}

pub(crate) struct ServiceContext<'a> {
    // output field for all data that should be written to the socket.  This vector is
    // fixed-sized.  Because we wait for write completion before encoding more, the capacity of
    // this vector represents a bound on the amount of data between the client and the socket.
    pub(crate) to_socket: &'a mut Vec<u8>,
    pub(crate) current_time: Instant,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ProtocolStateType {
    Disconnected,
    PendingConnack,
    Connected,
    PendingDisconnect,
    Halted
}

pub(crate) fn is_connection_established(state: ProtocolStateType) -> bool {
    state == ProtocolStateType::Connected
}

impl Display for ProtocolStateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolStateType::Disconnected => { write!(f, "Disconnected") }
            ProtocolStateType::PendingConnack => { write!(f, "PendingConnack") }
            ProtocolStateType::Connected => { write!(f, "Connected") }
            ProtocolStateType::PendingDisconnect => { write!(f, "PendingDisconnect") }
            ProtocolStateType::Halted => { write!(f, "Halted") }
        }
    }
}

pub(crate) struct ProtocolStateConfig {
    pub connect_options: ConnectOptions,

    pub base_timestamp: Instant,

    pub ack_timeout: Duration,

    pub session_store: Option<Box<dyn SessionStore>>,

    // connection identity the durable session records are scoped to
    pub session_endpoint: Endpoint,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProtocolQueueType {
    User,
    Resubmit,
    HighPriority,
}

impl Display for ProtocolQueueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolQueueType::User => { write!(f, "User") }
            ProtocolQueueType::Resubmit => { write!(f, "Resubmit") }
            ProtocolQueueType::HighPriority => { write!(f, "HighPriority") }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ProtocolQueueServiceMode {
    All,
    HighPriorityOnly,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProtocolEnqueuePosition {
    Front,
    Back
}

impl Display for ProtocolEnqueuePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolEnqueuePosition::Front => { write!(f, "Front") }
            ProtocolEnqueuePosition::Back => { write!(f, "Back") }
        }
    }
}

enum OperationResponse {
    Publish(PublishResponse),
    Subscribe(SubackPacket),
    Unsubscribe(UnsubackPacket),
}

use crate::mqtt::suback::SubackPacket;
use crate::mqtt::unsuback::UnsubackPacket;

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct OperationTimeoutRecord {
    id: u64,
    timeout: Instant
}

impl PartialOrd for OperationTimeoutRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperationTimeoutRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timeout.cmp(&other.timeout)
    }
}

fn fold_timepoint(base: &Option<Instant>, new: &Instant) -> Option<Instant> {
    if let Some(base_timepoint) = base {
        if base_timepoint < new {
            return *base;
        }
    }

    Some(*new)
}

fn fold_optional_timepoint_min(base: &Option<Instant>, new: &Option<Instant>) -> Option<Instant> {
    if let Some(new_timepoint) = new {
        return fold_timepoint(base, new_timepoint);
    }

    *base
}

// Primary data structure that tracks MQTT-related state for the containing client.
pub(crate) struct ProtocolState {
    pub(crate) config: ProtocolStateConfig,

    state: ProtocolStateType,

    // the need to model time in a simple, test-controllable fashion leads to a solution where
    // the state thinks in time based on elapsed milliseconds since the state was created.
    current_time: Instant,
    elapsed_time_ms: u128,

    // Flag set by the service function after encoding bytes to be written to the socket.
    // Unset when we receive notice that the socket has fully accepted all encoded bytes.
    // No additional bytes are encoded while this flag is set.
    pending_write_completion: bool,

    // All incomplete operations tracked by the client
    operations: HashMap<u64, ClientOperation>,

    // Timeouts for all ack-based operations (qos1+ publish, subscribe, unsubscribe).  The
    // timeout only covers the period between operation-written-to-socket and
    // response-received-from-socket.
    operation_ack_timeouts: BinaryHeap<Reverse<OperationTimeoutRecord>>,

    // Intake queues

    // lowest priority queue; all user operations are added to the end on submission
    user_operation_queue: VecDeque<u64>,

    // qos1+ publishes that were interrupted by a disconnect or restored from the durable
    // session store; these are re-sent first on reconnection using the original order and
    // packet ids
    resubmit_operation_queue: VecDeque<u64>,

    // highest priority queue; for the connect, acks, pings, disconnect
    high_priority_operation_queue: VecDeque<u64>,

    // Service pulls operations from the intake queues based on priority order.  When an
    // operation becomes current, we bind a packet id if necessary, and set up the encoder to
    // encode it.  It stays there until the encoder has fully written all of the bytes to a
    // buffer.  For larger packets this may take a number of
    // [encode -> write to socket -> write completion] cycles.
    current_operation: Option<u64>,

    // Inbound qos2 publishes held back until their pubrel releases them.  Receiving a qos2
    // publish whose packet id is already in here is a duplicate delivery and must not surface
    // a second event.
    incomplete_incoming_publishes: HashMap<u16, PublishPacket>,

    // Tracks the packet ids in use by the client for outbound ack-based operations.  Does not
    // reset between connections.  Used to find unused packet ids for unbound operations.
    // { packet id -> operation id }
    allocated_packet_ids: HashMap<u16, u64>,

    // Tracks all qos1+ publishes that have been written to the socket but not yet completed.
    // A qos2 publish stays in this map from the time the publish is written until the pubcomp
    // is received or there is a disconnection.
    // { packet id -> operation id }
    pending_publish_operations: HashMap<u16, u64>,

    // Tracks all subscribes and unsubscribes that have been written to the socket but not yet
    // completed.
    // { packet id -> operation id }
    pending_non_publish_operations: HashMap<u16, u64>,

    // Tracks all incomplete operations that don't use acks that have been written to the
    // socket.  These operations will be completed on the next write completion event.
    pending_write_completion_operations: VecDeque<u64>,

    // Connection-scoped settings established by the CONNACK exchange
    current_settings: Option<NegotiatedSettings>,

    // monotonically-increasing operation id value
    next_operation_id: u64,

    // counter that helps us heuristically find an unused packet id with as little id-space
    // search as possible
    next_packet_id: u16,

    // Tracks if the containing client has previously successfully connected.
    has_connected_successfully: bool,

    // MQTT packet encode and decode
    encoder: Encoder,
    decoder: Decoder,

    // Keep alive liveness, one pinger per direction.  The send pinger is reset by every
    // successful write to the transport, the receive pinger by every inbound transport payload.
    send_pinger: Pinger,
    receive_pinger: Pinger,

    // Bounds the CONNECT/CONNACK handshake
    connack_timeout: Timeout,

    // Durable session records for in-flight qos1+ publish traffic
    session: SessionState,

    // Current MQTT version in use
    protocol_version: ProtocolVersion,
}

impl ProtocolState {

    // Crate-public API

    pub(crate) fn new(mut config: ProtocolStateConfig) -> MqttResult<ProtocolState> {
        let base_time = config.base_timestamp;
        let keep_alive = config.connect_options.keep_alive_interval_seconds;
        let protocol_version = config.connect_options.protocol_version;

        let endpoint = config.session_endpoint.clone();
        let client_id = config.connect_options.client_id.clone().unwrap_or_default();
        let store = config.session_store.take().unwrap_or_else(|| Box::new(MemorySessionStore::new()));
        let session = SessionState::new(store, endpoint.host(), endpoint.port(), endpoint.path(), &client_id);

        let mut state = ProtocolState {
            config,
            state: ProtocolStateType::Disconnected,
            current_time: base_time,
            elapsed_time_ms: 0,
            pending_write_completion : false,
            operations: HashMap::new(),
            operation_ack_timeouts: BinaryHeap::new(),
            user_operation_queue: VecDeque::new(),
            resubmit_operation_queue: VecDeque::new(),
            high_priority_operation_queue: VecDeque::new(),
            current_operation: None,
            incomplete_incoming_publishes: HashMap::new(),
            allocated_packet_ids: HashMap::new(),
            pending_publish_operations: HashMap::new(),
            pending_non_publish_operations: HashMap::new(),
            pending_write_completion_operations: VecDeque::new(),
            current_settings: None,
            next_operation_id : 1,
            next_packet_id : 1,
            has_connected_successfully: false,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            send_pinger: Pinger::new(keep_alive),
            receive_pinger: Pinger::new(keep_alive),
            connack_timeout: Timeout::new_unarmed(),
            session,
            protocol_version,
        };

        state.restore_session()?;

        Ok(state)
    }

    pub(crate) fn state(&self) -> ProtocolStateType {
        self.state
    }

    pub(crate) fn current_protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    // One-time downgrade applied by the client when a defaulted 3.1.1 configuration exhausts
    // every candidate endpoint without seeing a CONNACK.
    pub(crate) fn set_protocol_version(&mut self, protocol_version: ProtocolVersion) {
        info!("[{} ms] set_protocol_version - switching to {}", self.elapsed_time_ms, protocol_version);
        self.protocol_version = protocol_version;
    }

    pub(crate) fn handle_network_event(&mut self, context: &mut NetworkEventContext) -> MqttResult<()> {
        self.update_internal_clock(&context.current_time);

        let event = &context.event;
        let result =
            match &event {
                NetworkEvent::ConnectionOpened(_) => { self.handle_network_event_connection_opened(context) }
                NetworkEvent::ConnectionClosed => { self.handle_network_event_connection_closed(context) }
                NetworkEvent::WriteCompletion => { self.handle_network_event_write_completion(context) }
                NetworkEvent::IncomingData(data) => { self.handle_network_event_incoming_data(context, data) }
            };

        // Any error state returned from an event handler halts the client.  This is not always
        // an ERROR-error.  For example, write completion that includes a disconnect packet will
        // return an error, allowing us to reset the client nicely.
        if result.is_err() {
            error!("[{} ms] handle_network_event - final result: {:?}", self.elapsed_time_ms, result);
            self.change_state(ProtocolStateType::Halted);
        }

        result
    }

    pub(crate) fn service(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match self.state {
                ProtocolStateType::Disconnected => { self.service_disconnected(context) }
                ProtocolStateType::PendingConnack => { self.service_pending_connack(context) }
                ProtocolStateType::Connected => { self.service_connected(context) }
                ProtocolStateType::PendingDisconnect => { self.service_pending_disconnect(context) }
                ProtocolStateType::Halted => { Err(MqttError::new_internal_state_error("protocol state previously halted")) }
            };

        // Any error state returned from a service pass halts the client.
        if result.is_err() {
            error!("[{} ms] service - final result: {:?}", self.elapsed_time_ms, result);
            self.change_state(ProtocolStateType::Halted);
        }

        result
    }

    pub(crate) fn handle_user_event(&mut self, context: UserEventContext) {
        self.update_internal_clock(&context.current_time);

        let event = context.event;
        let (op_id, queue, position) =
            match event {
                UserEvent::Subscribe(packet, subscribe_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Subscribe(subscribe_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Unsubscribe(packet, unsubscribe_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Unsubscribe(unsubscribe_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Publish(packet, publish_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Publish(publish_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Disconnect(disconnect) => {
                    (self.create_operation(disconnect, None), ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front)
                }
            };

        debug!("[{} ms] handle_user_event - queuing operation with id {} into {} of {} queue", self.elapsed_time_ms, op_id, position, queue);
        self.enqueue_operation(op_id, queue, position);
    }

    pub(crate) fn get_next_service_timepoint(&mut self, current_time: &Instant) -> Option<Instant> {
        self.update_internal_clock(current_time);

        match self.state {
            ProtocolStateType::Disconnected => { None }
            ProtocolStateType::PendingConnack => { self.get_next_service_timepoint_pending_connack() }
            ProtocolStateType::Connected => { self.get_next_service_timepoint_connected() }
            ProtocolStateType::PendingDisconnect => { self.get_next_service_timepoint_pending_disconnect() }
            ProtocolStateType::Halted => { None }
        }
    }

    pub(crate) fn reset(&mut self, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != ProtocolStateType::Disconnected {
            self.state = ProtocolStateType::Halted;
        }

        let operations : Vec<u64> = self.operations.keys().copied().collect();
        for id in operations {
            let _ = self.complete_operation_as_failure(id, MqttError::new_client_closed());
        }

        self.pending_write_completion = false;
        self.operations.clear();
        self.operation_ack_timeouts.clear();
        self.user_operation_queue.clear();
        self.resubmit_operation_queue.clear();
        self.high_priority_operation_queue.clear();
        self.current_operation = None;
        self.incomplete_incoming_publishes.clear();
        self.allocated_packet_ids.clear();
        self.pending_publish_operations.clear();
        self.pending_non_publish_operations.clear();
        self.pending_write_completion_operations.clear();
        self.current_settings = None;
        self.next_packet_id = 1;
        self.has_connected_successfully = false;
        self.send_pinger.cancel();
        self.receive_pinger.cancel();
        self.connack_timeout.cancel();
    }

    pub(crate) fn get_negotiated_settings(&self) -> &Option<NegotiatedSettings> {
        &self.current_settings
    }

    // Private Implementation

    fn update_internal_clock(&mut self, current_time: &Instant) {
        self.current_time = *current_time;
        self.elapsed_time_ms = (*current_time - self.config.base_timestamp).as_millis();
    }

    // Rebuilds replayable traffic from the durable session store.  Sent publishes become
    // resubmit operations bound to their original packet ids, in their original submission
    // order; a publish whose pubrec was already seen resumes the handshake at pubrel.
    fn restore_session(&mut self) -> MqttResult<()> {
        let restored = self.session.restore()?;

        for entry in restored.sent {
            let packet_id = entry.publish.packet_id;
            let pubrec_received = entry.pubrec_received;

            let op_id = self.create_operation(Box::new(MqttPacket::Publish(entry.publish)), None);

            let operation = self.operations.get_mut(&op_id).unwrap();
            operation.packet_id = Some(packet_id);
            if pubrec_received {
                operation.qos2_pubrel = Some(Box::new(MqttPacket::Pubrel(PubrelPacket {
                    packet_id,
                })));
            }

            self.allocated_packet_ids.insert(packet_id, op_id);
            self.resubmit_operation_queue.push_back(op_id);
        }

        for publish in restored.received {
            self.incomplete_incoming_publishes.insert(publish.packet_id, publish);
        }

        Ok(())
    }

    fn has_pending_ack(&self) -> bool {
        !self.pending_publish_operations.is_empty() || !self.pending_non_publish_operations.is_empty()
    }

    fn apply_disconnect_completion(&mut self, operation: &ClientOperation) -> MqttResult<()> {
        if let MqttPacket::Disconnect(_) = &*operation.packet {
            if self.state == ProtocolStateType::PendingDisconnect {
                self.state = ProtocolStateType::Halted;
            }
            info!("[{} ms] apply_disconnect_completion - user-requested disconnect operation {} completed", self.elapsed_time_ms, operation.id);
            return Err(MqttError::new_user_initiated_disconnect());
        }

        Ok(())
    }

    fn complete_operation_as_success(&mut self, id : u64, completion_result: Option<OperationResponse>) -> MqttResult<()> {
        let operation_option = self.operations.remove(&id);
        if operation_option.is_none() {
            error!("[{} ms] complete_operation_as_success - operation id {} does not exist", self.elapsed_time_ms, id);
            return Err(MqttError::new_internal_state_error("cannot complete an operation that does not exist"));
        }

        let operation = operation_option.unwrap();
        if let Some(packet_id) = operation.packet_id {
            self.allocated_packet_ids.remove(&packet_id);
            self.pending_publish_operations.remove(&packet_id);
            self.pending_non_publish_operations.remove(&packet_id);

            // the ack flow is over; drop the durable mirror of this publish
            if let MqttPacket::Publish(publish) = &*operation.packet {
                if publish.qos != QualityOfService::AtMostOnce {
                    self.session.remove_sent(packet_id);
                }
            }
        }

        self.apply_disconnect_completion(&operation)?;

        if operation.options.is_none() {
            info!("[{} ms] complete_operation_as_success - internal {} operation {} completed", self.elapsed_time_ms, mqtt_packet_to_str(&operation.packet), id);
            return Ok(())
        }

        info!("[{} ms] complete_operation_as_success - user {} operation {} completed", self.elapsed_time_ms, mqtt_packet_to_str(&operation.packet), id);
        complete_operation_with_result(operation.options.unwrap(), completion_result)
    }

    fn complete_operation_as_failure(&mut self, id : u64, error: MqttError) -> MqttResult<()> {
        let operation_option = self.operations.remove(&id);
        if operation_option.is_none() {
            // not fatal; the limits of the priority queue implementation used for timeouts
            // can result in situations where we try to fail an operation that has already
            // completed
            warn!("[{} ms] complete_operation_as_failure ({}) - operation id {} does not exist", self.elapsed_time_ms, error, id);
            return Ok(())
        }

        let operation = operation_option.unwrap();
        if let Some(packet_id) = operation.packet_id {
            self.allocated_packet_ids.remove(&packet_id);
            self.pending_publish_operations.remove(&packet_id);
            self.pending_non_publish_operations.remove(&packet_id);
        }

        self.apply_disconnect_completion(&operation)?;

        if operation.options.is_none() {
            info!("[{} ms] complete_operation_as_failure ({}) - internal {} operation {} completed", self.elapsed_time_ms, error, mqtt_packet_to_str(&operation.packet), id);
            return Ok(())
        }

        info!("[{} ms] complete_operation_as_failure ({}) - user {} operation {} completed", self.elapsed_time_ms, error, mqtt_packet_to_str(&operation.packet), id);
        complete_operation_with_error(operation.options.unwrap(), error)
    }

    fn complete_operation_sequence_as_failure<T>(&mut self, iterator: T, error_fn: fn() -> MqttError) -> MqttResult<()> where T : Iterator<Item = u64> {
        #[allow(clippy::manual_try_fold)]
        iterator.fold(
            Ok(()),
            |res, item| {
                fold_mqtt_result(res, self.complete_operation_as_failure(item, error_fn()))
            }
        )
    }

    fn complete_operation_sequence_as_empty_success<T>(&mut self, iterator: T) -> MqttResult<()> where T : Iterator<Item = u64> {
        #[allow(clippy::manual_try_fold)]
        iterator.fold(
            Ok(()),
            |res, item| {
                fold_mqtt_result(res, self.complete_operation_as_success(item, None))
            }
        )
    }

    fn handle_network_event_connection_opened(&mut self, context: &NetworkEventContext) -> MqttResult<()> {
        if self.state != ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_connection_opened - called in invalid state", self.elapsed_time_ms);
            self.change_state(ProtocolStateType::Halted);
            return Err(MqttError::new_internal_state_error("connection opened in an invalid state"));
        }

        if let NetworkEvent::ConnectionOpened(connection_opened_context) = &context.event {
            info!("[{} ms] handle_network_event_connection_opened", self.elapsed_time_ms);
            self.change_state(ProtocolStateType::PendingConnack);
            self.current_operation = None;
            self.pending_write_completion = false;
            self.decoder.reset_for_new_connection();

            // Queue up a Connect packet
            let connect = self.create_connect();
            let connect_op_id = self.create_operation(connect, None);

            self.enqueue_operation(connect_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front);

            let connack_timeout = connection_opened_context.establishment_timeout;

            debug!("[{} ms] handle_network_event_connection_opened - setting connack timeout", self.elapsed_time_ms);
            self.connack_timeout.arm(connack_timeout);

            Ok(())
        } else {
            panic!("handle_network_event_connection_opened - invalid input");
        }
    }

    fn apply_connection_closed_to_current_operation(&mut self) -> MqttResult<()> {
        if let Some(id) = self.current_operation {
            if let Some(operation) = self.operations.get(&id) {
                match &*operation.packet {
                    MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                        self.user_operation_queue.push_front(id);
                    }
                    MqttPacket::Publish(publish) => {
                        if operation.qos2_pubrel.is_some() {
                            // stays in the pending publish table, which routes it to the
                            // resubmit queue below
                            self.high_priority_operation_queue.push_front(id);
                        } else if publish.duplicate {
                            self.resubmit_operation_queue.push_front(id);
                        } else {
                            self.user_operation_queue.push_front(id);
                        }
                    }
                    _ => {
                        self.complete_operation_as_failure(id, MqttError::new_connection_closed("internal operation failed on connection close"))?;
                    }
                }
            }
        }

        self.current_operation = None;

        Ok(())
    }

    fn handle_network_event_connection_closed(&mut self, _: &mut NetworkEventContext) -> MqttResult<()> {
        if self.state == ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_connection_closed - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("connection closed in an invalid state"));
        }

        info!("[{} ms] handle_network_event_connection_closed", self.elapsed_time_ms);
        self.change_state(ProtocolStateType::Disconnected);
        self.connack_timeout.cancel();
        self.send_pinger.cancel();
        self.receive_pinger.cancel();
        self.operation_ack_timeouts.clear();
        self.pending_write_completion = false;
        self.current_settings = None;

        self.apply_connection_closed_to_current_operation()?;

        let mut result : MqttResult<()> = Ok(());

        /*
         * high priority operations are processed as follows:
         *
         *   the connect, acks, and pings can all be failed without consequence
         *
         *   qos2 publishes whose pubrel was queued are left alone but not requeued here; the
         *   pending publish table processed below puts them in the resubmit queue
         */
        let mut high_priority : VecDeque<u64> = VecDeque::new();
        mem::swap(&mut high_priority, &mut self.high_priority_operation_queue);

        let failures : VecDeque<u64> = high_priority.into_iter().filter(|id| {
            self.operations.get(id).map(|operation| operation.qos2_pubrel.is_none()).unwrap_or(false)
        }).collect();

        result = fold_mqtt_result(result, self.complete_operation_sequence_as_failure(failures.into_iter(), generate_connection_closed_error));

        /*
         * operations awaiting a write completion: user-facing qos0 publishes get another
         * attempt on the next connection; internal operations (the connect, pings, acks) are
         * connection-scoped and just fail
         */
        let mut write_completions : VecDeque<u64> = VecDeque::new();
        mem::swap(&mut write_completions, &mut self.pending_write_completion_operations);

        let (mut retained, rejected) : (VecDeque<u64>, VecDeque<u64>) = write_completions.into_iter().partition(|id| {
            self.operations.get(id).map(|operation| matches!(&*operation.packet, MqttPacket::Publish(_))).unwrap_or(false)
        });

        self.user_operation_queue.append(&mut retained);
        result = fold_mqtt_result(result, self.complete_operation_sequence_as_failure(rejected.into_iter(), generate_connection_closed_error));

        /*
         * qos1+ publishes: mark as duplicate and move to the resubmit queue
         */
        let mut unacked_publish_table = HashMap::new();
        mem::swap(&mut unacked_publish_table, &mut self.pending_publish_operations);

        unacked_publish_table.into_iter().for_each(|(_, id) |{
            self.set_publish_duplicate_flag(id, true);
            self.resubmit_operation_queue.push_back(id);
        });

        /*
         * subscribe/unsubscribe go back to the user queue for a fresh attempt
         */
        let mut unacked_sub_unsub_table = HashMap::new();
        mem::swap(&mut unacked_sub_unsub_table, &mut self.pending_non_publish_operations);

        unacked_sub_unsub_table.into_iter().for_each(|(_, id) |{
            self.user_operation_queue.push_front(id);
        });

        result
    }

    fn handle_network_event_write_completion(&mut self, context: &NetworkEventContext) -> MqttResult<()> {
        if self.state == ProtocolStateType::Halted || self.state == ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_write_completion - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("write completion in an invalid state"));
        }

        if !self.pending_write_completion {
            error!("[{} ms] handle_network_event_write_completion - called with no pending completion", self.elapsed_time_ms);
            self.change_state(ProtocolStateType::Halted);

            return Err(MqttError::new_internal_state_error("write completion called with no pending completion"));
        }

        debug!("[{} ms] handle_network_event - write completion", self.elapsed_time_ms);

        self.pending_write_completion = false;

        // a successful write is transport activity in the send direction
        self.send_pinger.reset(context.current_time);

        let mut completions : VecDeque<u64> = VecDeque::new();
        mem::swap(&mut completions, &mut self.pending_write_completion_operations);

        self.complete_operation_sequence_as_empty_success(completions.iter().copied())
    }

    fn change_state(&mut self, next_state: ProtocolStateType) {
        debug!("[{} ms] change_state - transitioning from {} to {}", self.elapsed_time_ms, self.state, next_state);
        self.state = next_state;
    }

    fn is_connect_packet(&self, id: u64) -> bool {
        if let Some(operation) = self.operations.get(&id) {
            return mqtt_packet_to_packet_type(&operation.packet) == PacketType::Connect;
        }

        false
    }

    fn is_connect_in_queue(&self) -> bool {
        self.high_priority_operation_queue.iter().any(|id| self.is_connect_packet(*id))
    }

    fn handle_network_event_incoming_data(&mut self, context: &mut NetworkEventContext, data: &[u8]) -> MqttResult<()> {
        if self.state == ProtocolStateType::Disconnected || self.state == ProtocolStateType::Halted {
            error!("[{} ms] handle_network_event_incoming_data - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("incoming network data while in an invalid state"));
        }

        if self.state == ProtocolStateType::PendingConnack && self.is_connect_in_queue() {
            error!("[{} ms] handle_network_event_incoming_data - data received before CONNECT sent", self.elapsed_time_ms);
            self.change_state(ProtocolStateType::Halted);
            return Err(MqttError::new_protocol_error("data received before CONNECT sent"));
        }

        debug!("[{} ms] handle_network_event_incoming_data received {} bytes", self.elapsed_time_ms, data.len());

        // any inbound payload is transport activity in the receive direction
        self.receive_pinger.reset(context.current_time);

        let mut decoded_packets = VecDeque::new();
        let mut decode_context = DecodingContext {
            maximum_packet_size: MAXIMUM_VARIABLE_LENGTH_INTEGER as u32,
            decoded_packets: &mut decoded_packets
        };

        let decode_result = self.decoder.decode_bytes(data, &mut decode_context);
        if decode_result.is_err() {
            error!("[{} ms] handle_network_event_incoming_data - decode failure", self.elapsed_time_ms);
            self.change_state(ProtocolStateType::Halted);
            return decode_result;
        }

        for packet in decoded_packets {
            let validation_result = validate_packet_inbound(&packet);
            if validation_result.is_err() {
                error!("[{} ms] handle_network_event_incoming_data - incoming packet validation failure", self.elapsed_time_ms);
                self.change_state(ProtocolStateType::Halted);
                return validation_result;
            }

            let handler_result = self.handle_packet(packet, context);
            if handler_result.is_err() {
                error!("[{} ms] handle_network_event_incoming_data - packet handling failure", self.elapsed_time_ms);
                self.change_state(ProtocolStateType::Halted);
                return handler_result;
            }
        }

        Ok(())
    }

    fn dequeue_operation(&mut self, mode: ProtocolQueueServiceMode) -> Option<u64> {
        if self.pending_write_completion {
            return None;
        }

        if !self.high_priority_operation_queue.is_empty() {
            return Some(self.high_priority_operation_queue.pop_front().unwrap());
        }

        if mode != ProtocolQueueServiceMode::HighPriorityOnly {
            if !self.resubmit_operation_queue.is_empty() {
                return Some(self.resubmit_operation_queue.pop_front().unwrap());
            }

            if !self.user_operation_queue.is_empty() {
                return Some(self.user_operation_queue.pop_front().unwrap());
            }
        }

        None
    }

    fn get_next_ack_timeout(&mut self) -> Option<u64> {
        if let Some(reverse_record) = self.operation_ack_timeouts.peek() {
            let record = &reverse_record.0;
            if record.timeout <= self.current_time {
                return Some(record.id);
            }
        }

        None
    }

    fn process_ack_timeouts(&mut self) -> MqttResult<()> {
        let mut result = Ok(());

        while let Some(id) = self.get_next_ack_timeout() {
            self.operation_ack_timeouts.pop();
            result = fold_mqtt_result(result, self.complete_operation_as_failure(id, MqttError::new_ack_timeout()));
        }

        result
    }

    fn get_operation_timeout_duration(&self, operation: &ClientOperation) -> Option<Duration> {
        let explicit_timeout =
            match &operation.options {
                Some(ClientOperationOptions::Subscribe(subscribe_options)) => { subscribe_options.options.timeout }
                Some(ClientOperationOptions::Unsubscribe(unsubscribe_options)) => { unsubscribe_options.options.timeout }
                Some(ClientOperationOptions::Publish(publish_options)) => { publish_options.options.timeout }
                None => { return None; }
            };

        // only ack-based packets get an ack timeout
        match &*operation.packet {
            MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {}
            MqttPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtMostOnce {
                    return None;
                }
            }
            _ => { return None; }
        }

        Some(explicit_timeout.unwrap_or(self.config.ack_timeout))
    }

    fn start_operation_ack_timeout(&mut self, id: u64, now: Instant) {
        let mut timeout_duration_option : Option<Duration> = None;
        if let Some(operation) = self.operations.get(&id) {
            timeout_duration_option = self.get_operation_timeout_duration(operation);
        }

        if let Some(timeout_duration) = timeout_duration_option {
            let timeout_record = OperationTimeoutRecord {
                id,
                timeout: now + timeout_duration
            };

            self.operation_ack_timeouts.push(Reverse(timeout_record));
        }
    }

    fn on_current_operation_fully_written(&mut self, now: Instant) {
        let operation = self.operations.get_mut(&self.current_operation.unwrap()).unwrap();
        let packet = &*operation.packet;
        match packet {
            MqttPacket::Subscribe(subscribe) => {
                self.pending_non_publish_operations.insert(subscribe.packet_id, operation.id);
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                self.pending_non_publish_operations.insert(unsubscribe.packet_id, operation.id);
            }
            MqttPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtMostOnce {
                    self.pending_write_completion_operations.push_back(operation.id);
                } else {
                    self.pending_publish_operations.insert(publish.packet_id, operation.id);
                }
            }
            MqttPacket::Disconnect(_) => {
                self.state = ProtocolStateType::PendingDisconnect;
                self.pending_write_completion_operations.push_back(operation.id);
            }
            _ => {
                self.pending_write_completion_operations.push_back(operation.id);
            }
        }

        let id = operation.id;
        self.start_operation_ack_timeout(id, now);

        self.current_operation = None;
    }

    fn service_disconnected(&mut self, _: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_disconnected", self.elapsed_time_ms);
        Ok(())
    }

    fn service_queue_aux(&mut self, context: &mut ServiceContext, mode: ProtocolQueueServiceMode) -> MqttResult<()> {
        while self.state == ProtocolStateType::PendingConnack || self.state == ProtocolStateType::Connected {
            if self.current_operation.is_none() {
                self.current_operation = self.dequeue_operation(mode);
                if self.current_operation.is_none() {
                    debug!("[{} ms] service_queue - no operations ready for processing", self.elapsed_time_ms);
                    return Ok(())
                }

                let current_operation_id = self.current_operation.unwrap();
                debug!("[{} ms] service_queue - operation {} dequeued for processing", self.elapsed_time_ms, current_operation_id);
                if !self.operations.contains_key(&current_operation_id) {
                    warn!("[{} ms] service_queue - operation {} does not exist", self.elapsed_time_ms, current_operation_id);
                    self.current_operation = None;
                    continue;
                }

                self.acquire_packet_id_for_operation(current_operation_id)?;

                let operation = self.operations.get(&current_operation_id).unwrap();
                let mut packet = &*operation.packet;
                if let Some(pubrel) = &operation.qos2_pubrel {
                    packet = &**pubrel;
                }

                if let Err(error) = validate_packet_outbound(packet) {
                    warn!("[{} ms] service_queue - {} operation {} failed last-chance validation", self.elapsed_time_ms, mqtt_packet_to_str(packet), current_operation_id);
                    self.current_operation = None;
                    self.complete_operation_as_failure(current_operation_id, error)?;
                    continue;
                }

                let encode_context = EncodingContext {
                    protocol_version: self.protocol_version,
                };

                debug!("[{} ms] service_queue - operation {} submitted to encoder for setup", self.elapsed_time_ms, current_operation_id);
                self.encoder.reset(packet, &encode_context)?;
            }

            let operation = self.operations.get(&self.current_operation.unwrap()).unwrap();
            let mut packet = &*operation.packet;
            if let Some(pubrel) = &operation.qos2_pubrel {
                packet = &**pubrel;
            }

            let encode_result = self.encoder.encode(packet, context.to_socket)?;
            if encode_result == EncodeResult::Complete {
                debug!("[{} ms] service_queue - operation {} encoding complete", self.elapsed_time_ms, self.current_operation.unwrap());
                self.on_current_operation_fully_written(context.current_time);
            } else {
                debug!("[{} ms] service_queue - operation {} encoding still in progress", self.elapsed_time_ms, self.current_operation.unwrap());
                return Ok(())
            }
        }

        Ok(())
    }

    fn service_queue(&mut self, context: &mut ServiceContext, mode: ProtocolQueueServiceMode) -> MqttResult<()> {
        let to_socket_length = context.to_socket.len();

        let result = self.service_queue_aux(context, mode);

        if context.to_socket.len() != to_socket_length {
            self.pending_write_completion = true;
        }

        result
    }

    fn service_pending_connack(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_pending_connack", self.elapsed_time_ms);

        if self.connack_timeout.expired(context.current_time) {
            error!("[{} ms] service_pending_connack - connack timeout exceeded", self.elapsed_time_ms);
            return Err(MqttError::new_connack_timeout());
        }

        self.service_queue(context, ProtocolQueueServiceMode::HighPriorityOnly)?;

        Ok(())
    }

    fn service_keep_alive(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        let mut ping_wanted = false;

        match self.send_pinger.tick(context.current_time) {
            PingerEvent::TimedOut => {
                error!("[{} ms] service_keep_alive - send direction keep alive timeout exceeded", self.elapsed_time_ms);
                return Err(MqttError::new_keep_alive_timeout());
            }
            PingerEvent::SendPingreq => { ping_wanted = true; }
            PingerEvent::None => {}
        }

        match self.receive_pinger.tick(context.current_time) {
            PingerEvent::TimedOut => {
                error!("[{} ms] service_keep_alive - receive direction keep alive timeout exceeded", self.elapsed_time_ms);
                return Err(MqttError::new_keep_alive_timeout());
            }
            PingerEvent::SendPingreq => { ping_wanted = true; }
            PingerEvent::None => {}
        }

        if ping_wanted {
            debug!("[{} ms] service_keep_alive - keep alive interval reached, sending ping", self.elapsed_time_ms);
            let ping = Box::new(MqttPacket::Pingreq(PingreqPacket{}));
            let ping_op_id = self.create_operation(ping, None);

            self.enqueue_operation(ping_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front);
        }

        Ok(())
    }

    fn service_connected(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_connected", self.elapsed_time_ms);

        self.service_keep_alive(context)?;
        self.service_queue(context, ProtocolQueueServiceMode::All)?;
        self.process_ack_timeouts()?;

        Ok(())
    }

    fn service_pending_disconnect(&mut self, _: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_pending_disconnect", self.elapsed_time_ms);

        self.process_ack_timeouts()?;

        Ok(())
    }

    fn get_next_service_timepoint_protocol_queue(&self, mode: ProtocolQueueServiceMode) -> Option<Instant> {
        if self.pending_write_completion {
            return None;
        }

        if !self.high_priority_operation_queue.is_empty() {
            return Some(self.current_time);
        }

        if mode == ProtocolQueueServiceMode::All
            && (!self.resubmit_operation_queue.is_empty() || !self.user_operation_queue.is_empty()) {
            return Some(self.current_time);
        }

        None
    }

    fn get_next_service_timepoint_pending_connack(&self) -> Option<Instant> {
        let mut next_service_time = self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::HighPriorityOnly);

        next_service_time = fold_optional_timepoint_min(&next_service_time, &self.connack_timeout.deadline());

        next_service_time
    }

    fn get_next_service_timepoint_connected(&self) -> Option<Instant> {
        let mut next_service_time: Option<Instant> = fold_optional_timepoint_min(&None, &self.send_pinger.next_deadline());
        next_service_time = fold_optional_timepoint_min(&next_service_time, &self.receive_pinger.next_deadline());

        if let Some(ack_timeout) = self.operation_ack_timeouts.peek() {
            next_service_time = fold_timepoint(&next_service_time, &ack_timeout.0.timeout);
        }

        if self.pending_write_completion {
            return next_service_time;
        }

        fold_optional_timepoint_min(&self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::All), &next_service_time)
    }

    fn get_next_service_timepoint_pending_disconnect(&self) -> Option<Instant> {
        let mut next_service_time = self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::HighPriorityOnly);

        if let Some(ack_timeout) = self.operation_ack_timeouts.peek() {
            next_service_time = fold_timepoint(&next_service_time, &ack_timeout.0.timeout);
        }

        next_service_time
    }

    fn unbind_operation_packet_id(&mut self, id: u64) {
        if let Some(operation) = self.operations.get_mut(&id) {
            if let Some(packet_id) = operation.packet_id {
                self.allocated_packet_ids.remove(&packet_id);
                operation.unbind_packet_id();
            }
        }
    }

    fn set_publish_duplicate_flag(&mut self, id: u64, value: bool) {
        if let Some(operation) = self.operations.get_mut(&id) {
            if let MqttPacket::Publish(publish) = &mut *operation.packet {
                debug!("[{} ms] set_publish_duplicate_flag - setting publish operation {} duplicate field to {}", self.elapsed_time_ms, id, value);
                publish.duplicate = value;
            }
        }
    }

    fn sort_operation_deque(queue: &mut VecDeque<u64>) {
        queue.make_contiguous().sort_unstable();
    }

    // Clean session: everything durable and everything mid-replay is discarded on a successful
    // CONNACK, matching the server having dropped its half of the session.
    fn purge_session_state(&mut self) -> MqttResult<()> {
        info!("[{} ms] purge_session_state - clean session connect, dropping all session state", self.elapsed_time_ms);
        self.session.clear();
        self.incomplete_incoming_publishes.clear();

        let mut resubmit = VecDeque::new();
        mem::swap(&mut resubmit, &mut self.resubmit_operation_queue);

        self.complete_operation_sequence_as_failure(resubmit.into_iter(), generate_session_purged_error)
    }

    fn handle_connack(&mut self, packet: Box<MqttPacket>, context: &mut NetworkEventContext) -> MqttResult<()> {
        if let MqttPacket::Connack(connack) = *packet {
            info!("[{} ms] handle_connack - processing CONNACK packet", self.elapsed_time_ms);

            if self.state != ProtocolStateType::PendingConnack {
                error!("[{} ms] handle_connack - invalid state to receive a connack", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state for connack receipt"));
            }

            self.connack_timeout.cancel();

            if self.config.connect_options.clean_session {
                self.purge_session_state()?;
            }

            if connack.return_code != ConnectReturnCode::Accepted {
                error!("[{} ms] handle_connack - connection rejected with return code {}", self.elapsed_time_ms, connack.return_code as u8);
                let return_code = connack.return_code;
                context.packet_events.push_back(PacketEvent::Connack(connack));
                return Err(MqttError::new_connection_rejected(return_code));
            }

            self.change_state(ProtocolStateType::Connected);
            self.has_connected_successfully = true;

            let settings = NegotiatedSettings {
                client_id: self.config.connect_options.client_id.clone().unwrap_or_default(),
                rejoined_session: connack.session_present,
                keep_alive_interval_seconds: self.config.connect_options.keep_alive_interval_seconds,
                protocol_version: self.protocol_version,
            };
            debug!("[{} ms] handle_connack - negotiated settings: {:?}", self.elapsed_time_ms, &settings);
            self.current_settings = Some(settings);

            self.send_pinger.reset(context.current_time);
            self.receive_pinger.reset(context.current_time);

            // anything in the user queue is starting over on this connection, so drop stale
            // packet id associations
            let mut user_queue = VecDeque::new();
            mem::swap(&mut user_queue, &mut self.user_operation_queue);
            user_queue.iter().for_each(|id| {
                self.unbind_operation_packet_id(*id);
            });
            self.user_operation_queue = user_queue;

            // re-establish submission order after all the shuffling; operation ids are assigned
            // in submission/sequence order so an id sort restores it
            Self::sort_operation_deque(&mut self.resubmit_operation_queue);
            Self::sort_operation_deque(&mut self.user_operation_queue);

            context.packet_events.push_back(PacketEvent::Connack(connack));

            return Ok(());
        }

        panic!("handle_connack - invalid input");
    }

    fn handle_pingresp(&mut self, context: &NetworkEventContext) -> MqttResult<()> {
        info!("[{} ms] handle_pingresp - processing PINGRESP packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Connected | ProtocolStateType::PendingDisconnect => {
                self.send_pinger.reset(context.current_time);
                Ok(())
            }
            _ => {
                error!("[{} ms] handle_pingresp - invalid state to receive a PINGRESP", self.elapsed_time_ms);
                Err(MqttError::new_protocol_error("invalid state to receive a pingresp"))
            }
        }
    }

    fn handle_suback(&mut self, packet: Box<MqttPacket>) -> MqttResult<()> {
        info!("[{} ms] handle_suback - processing SUBACK packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_suback - invalid state to receive a SUBACK", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive a suback"));
            }
            _ => {}
        }

        if let MqttPacket::Suback(suback) = *packet {
            let packet_id = suback.packet_id;
            let operation_id_option = self.pending_non_publish_operations.get(&packet_id);
            if let Some(operation_id) = operation_id_option {
                // any per-topic failure code fails the whole subscribe with the complete
                // return code list attached
                if suback.return_codes.iter().any(|return_code| return_code.is_failure()) {
                    return self.complete_operation_as_failure(*operation_id, MqttError::new_subscription_failure(suback.return_codes));
                }

                return self.complete_operation_as_success(*operation_id, Some(OperationResponse::Subscribe(suback)));
            }

            error!("[{} ms] handle_suback - no matching operation corresponding to SUBACK packet id {}", self.elapsed_time_ms, packet_id);
            return Err(MqttError::new_protocol_error("no pending subscribe exists for incoming suback"));
        }

        panic!("handle_suback - invalid input");
    }

    fn handle_unsuback(&mut self, packet: Box<MqttPacket>) -> MqttResult<()> {
        info!("[{} ms] handle_unsuback - processing UNSUBACK packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_unsuback - invalid state to receive an UNSUBACK", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive an unsuback"));
            }
            _ => {}
        }

        if let MqttPacket::Unsuback(unsuback) = *packet {
            let packet_id = unsuback.packet_id;
            let operation_id_option = self.pending_non_publish_operations.get(&packet_id);
            if let Some(operation_id) = operation_id_option {
                return self.complete_operation_as_success(*operation_id, Some(OperationResponse::Unsubscribe(unsuback)));
            }

            error!("[{} ms] handle_unsuback - no matching operation corresponding to UNSUBACK packet id {}", self.elapsed_time_ms, packet_id);
            return Err(MqttError::new_protocol_error("no pending unsubscribe exists for incoming unsuback"));
        }

        panic!("handle_unsuback - invalid input");
    }

    fn handle_puback(&mut self, packet: Box<MqttPacket>) -> MqttResult<()> {
        info!("[{} ms] handle_puback - processing PUBACK packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_puback - invalid state to receive a PUBACK", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive a puback"));
            }
            _ => {}
        }

        if let MqttPacket::Puback(puback) = *packet {
            let packet_id = puback.packet_id;
            if let Some(operation_id) = self.pending_publish_operations.get(&packet_id) {
                return self.complete_operation_as_success(*operation_id, Some(OperationResponse::Publish(PublishResponse::Qos1(puback))));
            }

            // a replayed ack for a publish completed before a restart; nothing to do
            warn!("[{} ms] handle_puback - no matching operation corresponding to PUBACK packet id {}", self.elapsed_time_ms, packet_id);
            return Ok(());
        }

        panic!("handle_puback - invalid input");
    }

    fn handle_pubrec(&mut self, packet: Box<MqttPacket>) -> MqttResult<()> {
        info!("[{} ms] handle_pubrec - processing PUBREC packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_pubrec - invalid state to receive a PUBREC", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive a pubrec"));
            }
            _ => {}
        }

        if let MqttPacket::Pubrec(pubrec) = *packet {
            let packet_id = pubrec.packet_id;
            let operation_id_option = self.pending_publish_operations.get(&packet_id).copied();
            if let Some(operation_id) = operation_id_option {
                let operation_option = self.operations.get_mut(&operation_id);
                if let Some(operation) = operation_option {
                    if let MqttPacket::Publish(publish) = &*operation.packet {
                        if publish.qos == QualityOfService::ExactlyOnce {
                            operation.qos2_pubrel = Some(Box::new(MqttPacket::Pubrel(PubrelPacket {
                                packet_id,
                            })));

                            // continue the handshake from pubrel if we restart before pubcomp
                            if let MqttPacket::Publish(publish) = &*operation.packet {
                                self.session.store_sent(publish, true)?;
                            }

                            self.enqueue_operation(operation_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);
                            return Ok(());
                        }
                    }

                    error!("[{} ms] handle_pubrec - operation {} corresponding to packet id {} is not a QoS 2 publish", self.elapsed_time_ms, operation_id, packet_id);
                    return Err(MqttError::new_protocol_error("pubrec received for a pending operation that is not a qos2 publish"));
                }

                warn!("[{} ms] handle_pubrec - operation {} corresponding to packet id {} does not exist", self.elapsed_time_ms, operation_id, packet_id);
                return Ok(());
            }

            // a replayed pubrec for a handshake that already advanced; nothing to do
            warn!("[{} ms] handle_pubrec - no matching operation corresponding to PUBREC packet id {}", self.elapsed_time_ms, packet_id);
            return Ok(());
        }

        panic!("handle_pubrec - invalid input");
    }

    fn handle_pubrel(&mut self, packet: Box<MqttPacket>, context: &mut NetworkEventContext) -> MqttResult<()> {
        info!("[{} ms] handle_pubrel - processing PUBREL packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_pubrel - invalid state to receive a PUBREL", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive a pubrel"));
            }
            _ => {}
        }

        if let MqttPacket::Pubrel(pubrel) = &*packet {
            // release the held publish, if we still hold it; a pubrel with no matching held
            // publish is a replay from before a restart and only needs the pubcomp answer
            if let Some(publish) = self.incomplete_incoming_publishes.remove(&pubrel.packet_id) {
                self.session.remove_received(pubrel.packet_id);
                context.packet_events.push_back(PacketEvent::Publish(publish));
            }

            let pubcomp = Box::new(MqttPacket::Pubcomp(PubcompPacket{
                packet_id: pubrel.packet_id,
            }));
            let pubcomp_op_id = self.create_operation(pubcomp, None);

            self.enqueue_operation(pubcomp_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);

            return Ok(());
        }

        panic!("handle_pubrel - invalid input");
    }

    fn handle_pubcomp(&mut self, packet: Box<MqttPacket>) -> MqttResult<()> {
        info!("[{} ms] handle_pubcomp - processing PUBCOMP packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_pubcomp - invalid state to receive a PUBCOMP", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive a pubcomp"));
            }
            _ => {}
        }

        if let MqttPacket::Pubcomp(pubcomp) = *packet {
            let packet_id = pubcomp.packet_id;
            if let Some(operation_id) = self.pending_publish_operations.get(&packet_id) {
                return self.complete_operation_as_success(*operation_id, Some(OperationResponse::Publish(PublishResponse::Qos2(pubcomp))));
            }

            // a replayed ack for a handshake completed before a restart; nothing to do
            warn!("[{} ms] handle_pubcomp - no matching operation corresponding to PUBCOMP packet id {}", self.elapsed_time_ms, packet_id);
            return Ok(());
        }

        panic!("handle_pubcomp - invalid input");
    }

    fn handle_publish(&mut self, packet: Box<MqttPacket>, context: &mut NetworkEventContext) -> MqttResult<()> {
        info!("[{} ms] handle_publish - processing PUBLISH packet", self.elapsed_time_ms);
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                error!("[{} ms] handle_publish - invalid state to receive a PUBLISH", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_error("invalid state to receive a publish"));
            }
            _ => {}
        }

        if let MqttPacket::Publish(publish) = *packet {
            let packet_id = publish.packet_id;
            let qos = publish.qos;
            match qos {
                QualityOfService::AtMostOnce => {
                    context.packet_events.push_back(PacketEvent::Publish(publish));
                    Ok(())
                }

                QualityOfService::AtLeastOnce => {
                    context.packet_events.push_back(PacketEvent::Publish(publish));

                    let puback = Box::new(MqttPacket::Puback(PubackPacket{
                        packet_id,
                    }));
                    let puback_op_id = self.create_operation(puback, None);

                    self.enqueue_operation(puback_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);

                    Ok(())
                }

                QualityOfService::ExactlyOnce => {
                    // delivery is deferred until the pubrel releases it; a second receipt
                    // before that must not create a second deliverable copy
                    if !self.incomplete_incoming_publishes.contains_key(&packet_id) {
                        self.session.store_received(&publish)?;
                        self.incomplete_incoming_publishes.insert(packet_id, publish);
                    }

                    let pubrec = Box::new(MqttPacket::Pubrec(PubrecPacket{
                        packet_id,
                    }));
                    let pubrec_op_id = self.create_operation(pubrec, None);

                    self.enqueue_operation(pubrec_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);

                    Ok(())
                }
            }
        } else {
            panic!("handle_publish - invalid input");
        }
    }

    fn handle_packet(&mut self, packet: Box<MqttPacket>, context: &mut NetworkEventContext) -> MqttResult<()> {
        match &*packet {
            MqttPacket::Connack(_) => { self.handle_connack(packet, context) }
            MqttPacket::Publish(_) => { self.handle_publish(packet, context) }
            MqttPacket::Pingresp(_) => { self.handle_pingresp(context) }
            MqttPacket::Suback(_) => { self.handle_suback(packet) }
            MqttPacket::Unsuback(_) => { self.handle_unsuback(packet) }
            MqttPacket::Puback(_) => { self.handle_puback(packet) }
            MqttPacket::Pubcomp(_) => { self.handle_pubcomp(packet) }
            MqttPacket::Pubrel(_) => { self.handle_pubrel(packet, context) }
            MqttPacket::Pubrec(_) => { self.handle_pubrec(packet) }
            _ => {
                // includes DISCONNECT: 3.x brokers never send one
                error!("[{} ms] handle_packet - invalid packet type received", self.elapsed_time_ms);
                Err(MqttError::new_protocol_error("invalid packet type received"))
            }
        }
    }

    fn get_queue(&mut self, queue_type: ProtocolQueueType) -> &mut VecDeque<u64> {
        match queue_type {
            ProtocolQueueType::User => { &mut self.user_operation_queue }
            ProtocolQueueType::Resubmit => { &mut self.resubmit_operation_queue }
            ProtocolQueueType::HighPriority => { &mut self.high_priority_operation_queue }
        }
    }

    fn enqueue_operation(&mut self, id: u64, queue_type: ProtocolQueueType, position: ProtocolEnqueuePosition) {
        if !self.operations.contains_key(&id) {
            panic!("Attempt to enqueue a non-existent operation");
        }

        debug!("[{} ms] enqueue_operation - operation {} added to {} of queue {} ", self.elapsed_time_ms, id, position, queue_type);
        let queue = self.get_queue(queue_type);
        match position {
            ProtocolEnqueuePosition::Front => { queue.push_front(id); }
            ProtocolEnqueuePosition::Back => { queue.push_back(id); }
        }
    }

    fn create_operation(&mut self, packet: Box<MqttPacket>, options: Option<ClientOperationOptions>) -> u64 {
        let id = self.next_operation_id;
        self.next_operation_id += 1;

        info!("[{} ms] create_operation - building {} operation with id {}", self.elapsed_time_ms, mqtt_packet_to_str(&packet), id);

        let operation = ClientOperation {
            id,
            packet,
            qos2_pubrel: None,
            packet_id: None,
            options,
        };

        self.operations.insert(id, operation);

        id
    }

    fn create_connect(&self) -> Box<MqttPacket> {
        let connect = self.config.connect_options.to_connect_packet();

        Box::new(MqttPacket::Connect(connect))
    }

    fn acquire_free_packet_id(&mut self, operation_id: u64) -> MqttResult<u16> {
        let start_id = self.next_packet_id;
        let mut check_id = start_id;

        loop {
            if self.next_packet_id == u16::MAX {
                self.next_packet_id = 1;
            } else {
                self.next_packet_id += 1;
            }

            if let hash_map::Entry::Vacant(e) = self.allocated_packet_ids.entry(check_id) {
                e.insert(operation_id);
                return Ok(check_id);
            }

            if self.next_packet_id == start_id {
                error!("[{} ms] acquire_free_packet_id - operation {} could not find an unbound packet id", self.elapsed_time_ms, operation_id);
                return Err(MqttError::new_internal_state_error("packet id space exhausted"));
            }

            check_id = self.next_packet_id;
        }
    }

    fn acquire_packet_id_for_operation(&mut self, operation_id: u64) -> MqttResult<()> {
        let operation = self.operations.get(&operation_id).unwrap();

        if let Some(packet_id) = operation.packet_id {
            debug!("[{} ms] acquire_packet_id_for_operation - operation {} reusing existing packet id binding: {}", self.elapsed_time_ms, operation_id, packet_id);
            return Ok(());
        }

        match &*operation.packet {
            MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => { }
            MqttPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtMostOnce {
                    return Ok(());
                }
            }
            _ => { return Ok(()); }
        }

        let packet_id = self.acquire_free_packet_id(operation_id)?;

        let operation = self.operations.get_mut(&operation_id).unwrap();
        operation.bind_packet_id(packet_id);

        // the durable mirror is written the moment the id binding makes the publish replayable
        if let MqttPacket::Publish(publish) = &*operation.packet {
            if publish.qos != QualityOfService::AtMostOnce {
                self.session.store_sent(publish, false)?;
            }
        }

        Ok(())
    }
}

fn generate_connection_closed_error() -> MqttError {
    MqttError::new_connection_closed("internal operation failed due to connection close event")
}

fn generate_session_purged_error() -> MqttError {
    MqttError::new_connection_closed("session state purged by clean session connect")
}

fn complete_operation_with_result(operation_options: ClientOperationOptions, completion_result: Option<OperationResponse>) -> MqttResult<()> {
    match operation_options {
        ClientOperationOptions::Publish(publish_options) => {
            let response =
                match completion_result {
                    Some(OperationResponse::Publish(publish_response)) => { publish_response }
                    None => { PublishResponse::Qos0 }
                    _ => { return Err(MqttError::new_internal_state_error("invalid publish completion result")); }
                };

            if let Some(response_sender) = publish_options.response_sender {
                if response_sender.send(Ok(response)).is_err() {
                    warn!("complete_operation_with_result - publish result receiver already dropped");
                }
            }
        }
        ClientOperationOptions::Subscribe(subscribe_options) => {
            let Some(OperationResponse::Subscribe(suback)) = completion_result else {
                return Err(MqttError::new_internal_state_error("invalid subscribe completion result"));
            };

            if let Some(response_sender) = subscribe_options.response_sender {
                if response_sender.send(Ok(suback)).is_err() {
                    warn!("complete_operation_with_result - subscribe result receiver already dropped");
                }
            }
        }
        ClientOperationOptions::Unsubscribe(unsubscribe_options) => {
            let Some(OperationResponse::Unsubscribe(unsuback)) = completion_result else {
                return Err(MqttError::new_internal_state_error("invalid unsubscribe completion result"));
            };

            if let Some(response_sender) = unsubscribe_options.response_sender {
                if response_sender.send(Ok(unsuback)).is_err() {
                    warn!("complete_operation_with_result - unsubscribe result receiver already dropped");
                }
            }
        }
    }

    Ok(())
}

fn complete_operation_with_error(operation_options: ClientOperationOptions, error: MqttError) -> MqttResult<()> {
    match operation_options {
        ClientOperationOptions::Publish(publish_options) => {
            if let Some(response_sender) = publish_options.response_sender {
                if response_sender.send(Err(error)).is_err() {
                    warn!("complete_operation_with_error - publish result receiver already dropped");
                }
            }
        }
        ClientOperationOptions::Subscribe(subscribe_options) => {
            if let Some(response_sender) = subscribe_options.response_sender {
                if response_sender.send(Err(error)).is_err() {
                    warn!("complete_operation_with_error - subscribe result receiver already dropped");
                }
            }
        }
        ClientOperationOptions::Unsubscribe(unsubscribe_options) => {
            if let Some(response_sender) = unsubscribe_options.response_sender {
                if response_sender.send(Err(error)).is_err() {
                    warn!("complete_operation_with_error - unsubscribe result receiver already dropped");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;
    use crate::mqtt::disconnect::DisconnectPacket;
    use crate::mqtt::pingresp::PingrespPacket;
    use crate::mqtt::subscribe::SubscribePacket;
    use crate::session::MemorySessionStore;

    use assert_matches::assert_matches;
    use tokio::sync::oneshot;

    const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

    fn build_connect_options(clean_session: bool) -> ConnectOptions {
        ConnectOptionsBuilder::new()
            .with_client_id("test-client")
            .with_keep_alive_interval_seconds(10)
            .with_clean_session(clean_session)
            .build()
    }

    fn build_state(connect_options: ConnectOptions, store: MemorySessionStore, base: Instant) -> ProtocolState {
        ProtocolState::new(ProtocolStateConfig {
            connect_options,
            base_timestamp: base,
            ack_timeout: Duration::from_secs(30),
            session_store: Some(Box::new(store)),
            session_endpoint: Endpoint::new("localhost", 8080),
        }).unwrap()
    }

    // builds a fresh session state over the same backing store so tests can inspect what a
    // restarted client would find
    fn snapshot_store(store: &MemorySessionStore) -> RestoredSession {
        let mut session = SessionState::new(Box::new(store.clone()), "localhost", 8080, DEFAULT_ENDPOINT_PATH, "test-client");
        session.restore().unwrap()
    }

    fn decode_packets(bytes: &[u8]) -> Vec<MqttPacket> {
        let mut decoder = Decoder::new();
        decoder.reset_for_new_connection();

        let mut decoded = VecDeque::new();
        let mut decoding_context = DecodingContext {
            maximum_packet_size: MAXIMUM_VARIABLE_LENGTH_INTEGER as u32,
            decoded_packets: &mut decoded,
        };

        decoder.decode_bytes(bytes, &mut decoding_context).unwrap();

        decoded.into_iter().map(|boxed| *boxed).collect()
    }

    // repeatedly services the state, acknowledging each write, until it goes quiet; returns
    // everything that would have hit the socket
    fn service_round(state: &mut ProtocolState, now: Instant) -> Vec<u8> {
        let mut collected = Vec::new();

        loop {
            let mut to_socket = Vec::with_capacity(16 * 1024);
            let mut service_context = ServiceContext {
                to_socket: &mut to_socket,
                current_time: now,
            };

            state.service(&mut service_context).unwrap();

            if to_socket.is_empty() {
                break;
            }

            collected.extend_from_slice(&to_socket);

            let mut events = VecDeque::new();
            let mut completion_context = NetworkEventContext {
                event: NetworkEvent::WriteCompletion,
                current_time: now,
                packet_events: &mut events,
            };

            state.handle_network_event(&mut completion_context).unwrap();
        }

        collected
    }

    fn deliver_packet(state: &mut ProtocolState, packet: &MqttPacket, now: Instant) -> (MqttResult<()>, VecDeque<PacketEvent>) {
        let bytes = encode_packet_for_test(packet);

        let mut events = VecDeque::new();
        let result = {
            let mut context = NetworkEventContext {
                event: NetworkEvent::IncomingData(&bytes),
                current_time: now,
                packet_events: &mut events,
            };

            state.handle_network_event(&mut context)
        };

        (result, events)
    }

    fn open_connection(state: &mut ProtocolState, now: Instant) -> Vec<u8> {
        let mut events = VecDeque::new();
        let mut context = NetworkEventContext {
            event: NetworkEvent::ConnectionOpened(ConnectionOpenedContext {
                establishment_timeout: now + CONNACK_TIMEOUT,
            }),
            current_time: now,
            packet_events: &mut events,
        };

        state.handle_network_event(&mut context).unwrap();

        service_round(state, now)
    }

    fn connect_to_broker(state: &mut ProtocolState, session_present: bool, now: Instant) -> VecDeque<PacketEvent> {
        let written = open_connection(state, now);
        let packets = decode_packets(&written);
        assert_eq!(1, packets.len());
        assert_matches!(&packets[0], MqttPacket::Connect(_));

        let connack = MqttPacket::Connack(ConnackPacket {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        });

        let (result, events) = deliver_packet(state, &connack, now);
        result.unwrap();
        assert_eq!(ProtocolStateType::Connected, state.state());

        events
    }

    fn submit_publish(state: &mut ProtocolState, publish: PublishPacket, now: Instant) -> oneshot::Receiver<PublishResult> {
        let (response_sender, receiver) = oneshot::channel();
        state.handle_user_event(UserEventContext {
            event: UserEvent::Publish(
                Box::new(MqttPacket::Publish(publish)),
                PublishOptionsInternal {
                    options: PublishOptions::default(),
                    response_sender: Some(response_sender),
                }),
            current_time: now,
        });

        receiver
    }

    fn submit_subscribe(state: &mut ProtocolState, subscribe: SubscribePacket, options: SubscribeOptions, now: Instant) -> oneshot::Receiver<SubscribeResult> {
        let (response_sender, receiver) = oneshot::channel();
        state.handle_user_event(UserEventContext {
            event: UserEvent::Subscribe(
                Box::new(MqttPacket::Subscribe(subscribe)),
                SubscribeOptionsInternal {
                    options,
                    response_sender: Some(response_sender),
                }),
            current_time: now,
        });

        receiver
    }

    #[test]
    fn connack_success_flushes_queued_operations_in_order() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(true), MemorySessionStore::new(), base);

        // operations submitted before the transport exists must queue, not vanish
        let mut subscribe_receiver = submit_subscribe(&mut state, SubscribePacket::new("metrics/#", QualityOfService::AtLeastOnce), SubscribeOptions::default(), base);
        let mut publish_receiver = submit_publish(&mut state, PublishPacket::new("metrics/cpu", QualityOfService::AtMostOnce, b"42"), base);

        // opening the transport flushes the CONNECT and nothing else
        let written = open_connection(&mut state, base);
        let packets = decode_packets(&written);
        assert_eq!(1, packets.len());
        assert_matches!(&packets[0], MqttPacket::Connect(_));
        assert_eq!(ProtocolStateType::PendingConnack, state.state());
        assert!(subscribe_receiver.try_recv().is_err());

        let connack = MqttPacket::Connack(ConnackPacket {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        });
        let (result, events) = deliver_packet(&mut state, &connack, base);
        result.unwrap();
        assert_eq!(1, events.len());
        assert_matches!(&events[0], PacketEvent::Connack(_));
        assert_eq!(ProtocolStateType::Connected, state.state());

        // queued operations drain in submission order
        let written = service_round(&mut state, base);
        let packets = decode_packets(&written);
        assert_eq!(2, packets.len());

        let MqttPacket::Subscribe(subscribe) = &packets[0] else {
            panic!("expected the subscribe to flush first");
        };
        assert_matches!(&packets[1], MqttPacket::Publish(_));

        // the qos0 publish completed on write completion
        assert_matches!(publish_receiver.try_recv(), Ok(Ok(PublishResponse::Qos0)));

        // the subscribe completes on its suback
        let suback = MqttPacket::Suback(SubackPacket {
            packet_id: subscribe.packet_id,
            return_codes: vec![SubscribeReturnCode::GrantedQos1],
        });
        let (result, _) = deliver_packet(&mut state, &suback, base);
        result.unwrap();

        let subscribe_result = subscribe_receiver.try_recv().unwrap().unwrap();
        assert_eq!(vec![SubscribeReturnCode::GrantedQos1], subscribe_result.return_codes);
    }

    #[test]
    fn connack_failure_rejected_without_session_replay() {
        let store = MemorySessionStore::new();

        // a previous incarnation left an unacknowledged publish behind
        {
            let mut session = SessionState::new(Box::new(store.clone()), "localhost", 8080, DEFAULT_ENDPOINT_PATH, "test-client");
            let orphaned = PublishPacket {
                packet_id: 3,
                topic: "telemetry/stream".to_string(),
                qos: QualityOfService::AtLeastOnce,
                payload: vec![1, 2, 3],
                ..Default::default()
            };
            session.store_sent(&orphaned, false).unwrap();
        }

        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), store, base);

        let written = open_connection(&mut state, base);
        assert_eq!(1, decode_packets(&written).len());

        let connack = MqttPacket::Connack(ConnackPacket {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        });
        let (result, events) = deliver_packet(&mut state, &connack, base);

        let error = result.unwrap_err();
        assert_matches!(&error, MqttError::ConnectionRejected(_));

        let message = format!("{}", error);
        assert!(message.contains('5'));
        assert!(message.contains("not authorized"));

        // the rejecting connack still surfaces to the caller, and nothing gets replayed
        assert_eq!(1, events.len());
        assert_matches!(&events[0], PacketEvent::Connack(connack) if connack.return_code == ConnectReturnCode::NotAuthorized);
        assert_eq!(ProtocolStateType::Halted, state.state());
    }

    #[test]
    fn clean_session_connack_purges_durable_state() {
        let store = MemorySessionStore::new();

        {
            let mut session = SessionState::new(Box::new(store.clone()), "localhost", 8080, DEFAULT_ENDPOINT_PATH, "test-client");
            let orphaned = PublishPacket {
                packet_id: 3,
                topic: "telemetry/stream".to_string(),
                qos: QualityOfService::AtLeastOnce,
                payload: vec![1, 2, 3],
                ..Default::default()
            };
            session.store_sent(&orphaned, false).unwrap();
        }

        let base = Instant::now();
        let mut state = build_state(build_connect_options(true), store.clone(), base);
        connect_to_broker(&mut state, false, base);

        // the clean session connect discarded the replay candidates and their records
        assert!(service_round(&mut state, base).is_empty());
        assert_eq!(0, snapshot_store(&store).sent.len());
    }

    #[test]
    fn qos1_publish_round_trip_with_durable_mirror() {
        let store = MemorySessionStore::new();
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), store.clone(), base);
        connect_to_broker(&mut state, false, base);

        let mut publish_receiver = submit_publish(&mut state, PublishPacket::new("telemetry/stream", QualityOfService::AtLeastOnce, b"reading"), base);

        let written = service_round(&mut state, base);
        let packets = decode_packets(&written);
        assert_eq!(1, packets.len());

        let MqttPacket::Publish(sent_publish) = &packets[0] else {
            panic!("expected a publish on the wire");
        };
        assert!(!sent_publish.duplicate);
        assert_ne!(0, sent_publish.packet_id);

        // the in-flight publish is mirrored durably until its ack arrives
        assert_eq!(1, snapshot_store(&store).sent.len());

        let puback = MqttPacket::Puback(PubackPacket { packet_id: sent_publish.packet_id });
        let (result, _) = deliver_packet(&mut state, &puback, base);
        result.unwrap();

        assert_matches!(publish_receiver.try_recv(), Ok(Ok(PublishResponse::Qos1(_))));
        assert_eq!(0, snapshot_store(&store).sent.len());

        // a replayed ack for an already-completed publish is tolerated
        let (result, _) = deliver_packet(&mut state, &puback, base);
        result.unwrap();
    }

    #[test]
    fn qos2_publish_round_trip() {
        let store = MemorySessionStore::new();
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), store.clone(), base);
        connect_to_broker(&mut state, false, base);

        let mut publish_receiver = submit_publish(&mut state, PublishPacket::new("telemetry/stream", QualityOfService::ExactlyOnce, b"reading"), base);

        let written = service_round(&mut state, base);
        let packets = decode_packets(&written);
        assert_eq!(1, packets.len());
        let MqttPacket::Publish(sent_publish) = &packets[0] else {
            panic!("expected a publish on the wire");
        };
        let packet_id = sent_publish.packet_id;

        // pubrec advances the handshake to pubrel and durably records the progress
        let pubrec = MqttPacket::Pubrec(PubrecPacket { packet_id });
        let (result, _) = deliver_packet(&mut state, &pubrec, base);
        result.unwrap();

        let written = service_round(&mut state, base);
        let packets = decode_packets(&written);
        assert_eq!(1, packets.len());
        assert_matches!(&packets[0], MqttPacket::Pubrel(pubrel) if pubrel.packet_id == packet_id);

        let snapshot = snapshot_store(&store);
        assert_eq!(1, snapshot.sent.len());
        assert!(snapshot.sent[0].pubrec_received);

        // the publish future does not resolve until the handshake concludes
        assert!(publish_receiver.try_recv().is_err());

        let pubcomp = MqttPacket::Pubcomp(PubcompPacket { packet_id });
        let (result, _) = deliver_packet(&mut state, &pubcomp, base);
        result.unwrap();

        assert_matches!(publish_receiver.try_recv(), Ok(Ok(PublishResponse::Qos2(_))));
        assert_eq!(0, snapshot_store(&store).sent.len());
    }

    #[test]
    fn session_replay_after_restart() {
        let store = MemorySessionStore::new();
        let base = Instant::now();

        let first_packet_id;
        let second_packet_id;

        {
            let mut state = build_state(build_connect_options(false), store.clone(), base);
            connect_to_broker(&mut state, false, base);

            let _qos1_receiver = submit_publish(&mut state, PublishPacket::new("telemetry/one", QualityOfService::AtLeastOnce, b"first"), base);
            let _qos2_receiver = submit_publish(&mut state, PublishPacket::new("telemetry/two", QualityOfService::ExactlyOnce, b"second"), base);

            let packets = decode_packets(&service_round(&mut state, base));
            assert_eq!(2, packets.len());

            let MqttPacket::Publish(first) = &packets[0] else { panic!("expected a publish"); };
            let MqttPacket::Publish(second) = &packets[1] else { panic!("expected a publish"); };
            first_packet_id = first.packet_id;
            second_packet_id = second.packet_id;

            // the qos2 handshake gets as far as pubrel before the "crash"
            let pubrec = MqttPacket::Pubrec(PubrecPacket { packet_id: second_packet_id });
            deliver_packet(&mut state, &pubrec, base).0.unwrap();
            let packets = decode_packets(&service_round(&mut state, base));
            assert_matches!(&packets[0], MqttPacket::Pubrel(_));
        }

        // a fresh client over the same store replays the interrupted traffic after connecting
        let mut state = build_state(build_connect_options(false), store.clone(), base);
        connect_to_broker(&mut state, true, base);

        let packets = decode_packets(&service_round(&mut state, base));
        assert_eq!(2, packets.len());

        // replay happens in original submission order; the acknowledged-to-pubrec publish
        // resumes as a pubrel rather than being resent in full
        let MqttPacket::Publish(replayed) = &packets[0] else {
            panic!("expected the interrupted qos1 publish to replay first");
        };
        assert_eq!(first_packet_id, replayed.packet_id);
        assert!(replayed.duplicate);
        assert_eq!("telemetry/one", replayed.topic);
        assert_eq!(b"first".to_vec(), replayed.payload);

        assert_matches!(&packets[1], MqttPacket::Pubrel(pubrel) if pubrel.packet_id == second_packet_id);

        // completing both acks drains the durable store
        deliver_packet(&mut state, &MqttPacket::Puback(PubackPacket { packet_id: first_packet_id }), base).0.unwrap();
        deliver_packet(&mut state, &MqttPacket::Pubcomp(PubcompPacket { packet_id: second_packet_id }), base).0.unwrap();

        assert_eq!(0, snapshot_store(&store).sent.len());
    }

    #[test]
    fn inbound_qos2_defers_delivery_until_pubrel() {
        let store = MemorySessionStore::new();
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), store.clone(), base);
        connect_to_broker(&mut state, false, base);

        let inbound = MqttPacket::Publish(PublishPacket {
            packet_id: 9,
            topic: "commands/restart".to_string(),
            qos: QualityOfService::ExactlyOnce,
            payload: b"now".to_vec(),
            ..Default::default()
        });

        // first receipt: held back, acknowledged with pubrec, durably recorded
        let (result, events) = deliver_packet(&mut state, &inbound, base);
        result.unwrap();
        assert_eq!(0, events.len());

        let packets = decode_packets(&service_round(&mut state, base));
        assert_matches!(&packets[..], [MqttPacket::Pubrec(pubrec)] if pubrec.packet_id == 9);
        assert_eq!(1, snapshot_store(&store).received.len());

        // redelivery before the pubrel must not surface a second copy
        let (result, events) = deliver_packet(&mut state, &inbound, base);
        result.unwrap();
        assert_eq!(0, events.len());

        let packets = decode_packets(&service_round(&mut state, base));
        assert_matches!(&packets[..], [MqttPacket::Pubrec(_)]);

        // the pubrel releases exactly one delivery
        let pubrel = MqttPacket::Pubrel(PubrelPacket { packet_id: 9 });
        let (result, events) = deliver_packet(&mut state, &pubrel, base);
        result.unwrap();
        assert_eq!(1, events.len());
        assert_matches!(&events[0], PacketEvent::Publish(publish) if publish.payload == b"now".to_vec());
        assert_eq!(0, snapshot_store(&store).received.len());

        let packets = decode_packets(&service_round(&mut state, base));
        assert_matches!(&packets[..], [MqttPacket::Pubcomp(pubcomp)] if pubcomp.packet_id == 9);

        // a replayed pubrel (broker never saw our pubcomp) still answers with a pubcomp and
        // delivers nothing
        let (result, events) = deliver_packet(&mut state, &pubrel, base);
        result.unwrap();
        assert_eq!(0, events.len());

        let packets = decode_packets(&service_round(&mut state, base));
        assert_matches!(&packets[..], [MqttPacket::Pubcomp(_)]);
    }

    #[test]
    fn keep_alive_pings_and_timeout() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), MemorySessionStore::new(), base);
        connect_to_broker(&mut state, false, base);

        // first interval expiry provokes a ping
        let ping_time = base + Duration::from_secs(10);
        let packets = decode_packets(&service_round(&mut state, ping_time));
        assert_matches!(&packets[..], [MqttPacket::Pingreq(_)]);

        // the broker answers, resetting liveness in both directions
        let pingresp = MqttPacket::Pingresp(PingrespPacket {});
        deliver_packet(&mut state, &pingresp, base + Duration::from_secs(11)).0.unwrap();

        let second_ping_time = base + Duration::from_secs(21);
        let packets = decode_packets(&service_round(&mut state, second_ping_time));
        assert_matches!(&packets[..], [MqttPacket::Pingreq(_)]);

        // this time nothing comes back; the next expiry is interpreted as a dead broker
        let timeout_time = base + Duration::from_secs(31);
        let mut to_socket = Vec::with_capacity(16 * 1024);
        let mut service_context = ServiceContext {
            to_socket: &mut to_socket,
            current_time: timeout_time,
        };

        let result = state.service(&mut service_context);
        assert_matches!(result, Err(MqttError::KeepAliveTimeout(_)));
        assert_eq!(ProtocolStateType::Halted, state.state());
    }

    #[test]
    fn connack_timeout_expiry() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), MemorySessionStore::new(), base);

        let written = open_connection(&mut state, base);
        assert_eq!(1, decode_packets(&written).len());

        let mut to_socket = Vec::with_capacity(16 * 1024);
        let mut service_context = ServiceContext {
            to_socket: &mut to_socket,
            current_time: base + CONNACK_TIMEOUT + Duration::from_secs(1),
        };

        let result = state.service(&mut service_context);
        assert_matches!(result, Err(MqttError::ConnackTimeout(_)));
        assert_eq!(ProtocolStateType::Halted, state.state());
    }

    #[test]
    fn subscribe_ack_timeout_fails_the_operation() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), MemorySessionStore::new(), base);
        connect_to_broker(&mut state, false, base);

        let options = SubscribeOptions { timeout: Some(Duration::from_secs(5)) };
        let mut subscribe_receiver = submit_subscribe(&mut state, SubscribePacket::new("metrics/#", QualityOfService::AtLeastOnce), options, base);

        let packets = decode_packets(&service_round(&mut state, base));
        assert_matches!(&packets[..], [MqttPacket::Subscribe(_)]);
        assert!(subscribe_receiver.try_recv().is_err());

        // no suback within the timeout window
        let written = service_round(&mut state, base + Duration::from_secs(6));
        assert!(written.is_empty());

        assert_matches!(subscribe_receiver.try_recv(), Ok(Err(MqttError::AckTimeout(_))));
    }

    #[test]
    fn suback_failure_code_fails_the_subscribe() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(false), MemorySessionStore::new(), base);
        connect_to_broker(&mut state, false, base);

        let mut subscribe_receiver = submit_subscribe(&mut state, SubscribePacket::new("metrics/#", QualityOfService::AtLeastOnce), SubscribeOptions::default(), base);

        let packets = decode_packets(&service_round(&mut state, base));
        let MqttPacket::Subscribe(subscribe) = &packets[0] else {
            panic!("expected a subscribe on the wire");
        };

        let suback = MqttPacket::Suback(SubackPacket {
            packet_id: subscribe.packet_id,
            return_codes: vec![SubscribeReturnCode::Failure],
        });
        deliver_packet(&mut state, &suback, base).0.unwrap();

        let subscribe_result = subscribe_receiver.try_recv().unwrap();
        assert_matches!(subscribe_result, Err(MqttError::SubscriptionFailure(context)) if context.return_codes == vec![SubscribeReturnCode::Failure]);
    }

    #[test]
    fn disconnect_flush_halts_the_protocol() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(true), MemorySessionStore::new(), base);
        connect_to_broker(&mut state, false, base);

        state.handle_user_event(UserEventContext {
            event: UserEvent::Disconnect(Box::new(MqttPacket::Disconnect(DisconnectPacket {}))),
            current_time: base,
        });

        let mut to_socket = Vec::with_capacity(16 * 1024);
        let mut service_context = ServiceContext {
            to_socket: &mut to_socket,
            current_time: base,
        };
        state.service(&mut service_context).unwrap();

        let packets = decode_packets(&to_socket);
        assert_matches!(&packets[..], [MqttPacket::Disconnect(_)]);
        assert_eq!(ProtocolStateType::PendingDisconnect, state.state());

        // flushing the disconnect halts the protocol state through the completion path
        let mut events = VecDeque::new();
        let mut completion_context = NetworkEventContext {
            event: NetworkEvent::WriteCompletion,
            current_time: base,
            packet_events: &mut events,
        };

        let result = state.handle_network_event(&mut completion_context);
        assert_matches!(result, Err(MqttError::UserInitiatedDisconnect(_)));
        assert_eq!(ProtocolStateType::Halted, state.state());
    }

    #[test]
    fn packet_id_allocation_skips_outstanding_ids_and_wraps() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(true), MemorySessionStore::new(), base);

        // force allocation near the top of the id space to exercise wraparound
        state.next_packet_id = 65534;

        let first = state.acquire_free_packet_id(1).unwrap();
        let second = state.acquire_free_packet_id(2).unwrap();
        let third = state.acquire_free_packet_id(3).unwrap();

        assert_eq!(65534, first);
        assert_eq!(65535, second);

        // zero is never a valid packet id; wraparound lands on 1
        assert_eq!(1, third);

        // an id stays unavailable until its entry is released
        state.next_packet_id = 65534;
        let fourth = state.acquire_free_packet_id(4).unwrap();
        assert_eq!(2, fourth);

        state.allocated_packet_ids.remove(&65535);
        state.next_packet_id = 65534;
        let fifth = state.acquire_free_packet_id(5).unwrap();
        assert_eq!(65535, fifth);
    }

    #[test]
    fn packet_id_allocation_fails_when_space_exhausted() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(true), MemorySessionStore::new(), base);

        for packet_id in 1..=u16::MAX {
            state.allocated_packet_ids.insert(packet_id, packet_id as u64);
        }

        let result = state.acquire_free_packet_id(70000);
        assert_matches!(result, Err(MqttError::InternalStateError(_)));
    }

    #[test]
    fn data_before_connect_flushed_is_a_protocol_error() {
        let base = Instant::now();
        let mut state = build_state(build_connect_options(true), MemorySessionStore::new(), base);

        let mut events = VecDeque::new();
        let mut context = NetworkEventContext {
            event: NetworkEvent::ConnectionOpened(ConnectionOpenedContext {
                establishment_timeout: base + CONNACK_TIMEOUT,
            }),
            current_time: base,
            packet_events: &mut events,
        };
        state.handle_network_event(&mut context).unwrap();

        // the broker cannot legally talk before our CONNECT has even hit the wire
        let connack = MqttPacket::Connack(ConnackPacket { ..Default::default() });
        let (result, _) = deliver_packet(&mut state, &connack, base);
        assert_matches!(result, Err(MqttError::ProtocolError(_)));
    }
}
