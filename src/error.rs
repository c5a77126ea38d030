/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::{ConnectReturnCode, PacketType, SubscribeReturnCode};
use crate::mqtt::utils::connect_return_code_to_str;

use std::error::Error;
use std::fmt;

/// Additional details about an EncodingFailure error variant
#[derive(Debug)]
pub struct EncodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a DecodingFailure error variant
#[derive(Debug)]
pub struct DecodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ProtocolError error variant
#[derive(Debug)]
pub struct ProtocolErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionEstablishmentFailure error variant
#[derive(Debug)]
pub struct ConnectionEstablishmentFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionRejected error variant
#[derive(Debug)]
pub struct ConnectionRejectedContext {

    /// CONNACK return code the broker refused the connection with
    pub return_code: ConnectReturnCode
}

/// Additional details about a ConnackTimeout error variant
#[derive(Debug)]
pub struct ConnackTimeoutContext {
}

/// Additional details about a KeepAliveTimeout error variant
#[derive(Debug)]
pub struct KeepAliveTimeoutContext {
}

/// Additional details about an AckTimeout error variant
#[derive(Debug)]
pub struct AckTimeoutContext {
}

/// Additional details about a SubscriptionFailure error variant
#[derive(Debug)]
pub struct SubscriptionFailureContext {

    /// the complete set of per-topic return codes from the failing SUBACK
    pub return_codes: Vec<SubscribeReturnCode>
}

/// Additional details about a PacketValidation error variant
#[derive(Debug)]
pub struct PacketValidationContext {

    /// type of packet that failed validation
    pub packet_type: PacketType,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a SessionStoreFailure error variant
#[derive(Debug)]
pub struct SessionStoreFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an OperationChannelFailure error variant
#[derive(Debug)]
pub struct OperationChannelFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a StdIoError error variant
#[derive(Debug)]
pub struct StdIoErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a UserInitiatedDisconnect error variant
#[derive(Debug)]
pub struct UserInitiatedDisconnectContext {
}

/// Additional details about a ClientClosed error variant
#[derive(Debug)]
pub struct ClientClosedContext {
}

/// Basic error type for the entire crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum MqttError {

    /// Error encountered while attempting to encode an MQTT packet
    EncodingFailure(EncodingFailureContext),

    /// Error encountered while attempting to decode an MQTT packet.  This is distinct from
    /// errors that arise from packets that violate protocol behavior requirements.  Examples
    /// include bad header flags, mismatches between remaining length fields and overall packet
    /// length, etc...
    DecodingFailure(DecodingFailureContext),

    /// Generic error emitted when the client encounters broker behavior that violates the MQTT
    /// specification in a way that cannot be safely ignored or recovered from.  Receiving a
    /// server-originated DISCONNECT or an unknown packet type falls in this category.
    ProtocolError(ProtocolErrorContext),

    /// Error emitted by the client when something happens that should never happen.  Always
    /// indicates a bug in the client.
    InternalStateError(InternalStateErrorContext),

    /// Error emitted when a successfully established connection subsequently gets closed.
    ConnectionClosed(ConnectionClosedContext),

    /// Error emitted when a connection attempt fails for any reason prior to the receipt of a
    /// successful CONNACK.
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// Error emitted when the broker explicitly rejects the CONNECT attempt with a non-zero
    /// CONNACK return code.
    ConnectionRejected(ConnectionRejectedContext),

    /// Error emitted when the broker does not respond to the client's CONNECT packet within
    /// the configured time bound.
    ConnackTimeout(ConnackTimeoutContext),

    /// Error emitted when a keep alive interval elapses twice with no sign of life from the
    /// broker.  The broker is presumed dead and the connection is torn down.
    KeepAliveTimeout(KeepAliveTimeoutContext),

    /// Error applied to user-submitted operations whose matching ack did not arrive within the
    /// operation's timeout interval.
    AckTimeout(AckTimeoutContext),

    /// Error applied to subscribe operations whose SUBACK contained one or more per-topic
    /// failure return codes.
    SubscriptionFailure(SubscriptionFailureContext),

    /// Error emitted when a packet is submitted or received that violates the MQTT
    /// specification.
    PacketValidation(PacketValidationContext),

    /// Error emitted when a durable session record fails to parse or has an unrecognized
    /// type or version.
    SessionStoreFailure(SessionStoreFailureContext),

    /// Failure encountered while using MQTT operation channel functionality
    OperationChannelFailure(OperationChannelFailureContext),

    /// Generic error associated with the underlying message transport.  Mostly wraps websocket
    /// implementation specific errors.
    TransportError(TransportErrorContext),

    /// Generic error wrapping std::io::Error
    StdIoError(StdIoErrorContext),

    /// Error emitted by the client after flushing a user-submitted DISCONNECT packet as part
    /// of a `stop()` invocation.  Does not indicate an actual failure.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// Error applied to all unfinished client operations when the client is closed by the user.
    ClientClosed(ClientClosedContext),
}

impl MqttError {

    pub(crate) fn new_encoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::EncodingFailure(
            EncodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_decoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::DecodingFailure(
            DecodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_protocol_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ProtocolError(
            ProtocolErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ConnectionClosed(
            ConnectionClosedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_establishment_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ConnectionEstablishmentFailure(
            ConnectionEstablishmentFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_rejected(return_code: ConnectReturnCode) -> Self {
        MqttError::ConnectionRejected(
            ConnectionRejectedContext {
                return_code
            }
        )
    }

    pub(crate) fn new_connack_timeout() -> Self {
        MqttError::ConnackTimeout(
            ConnackTimeoutContext {
            }
        )
    }

    pub(crate) fn new_keep_alive_timeout() -> Self {
        MqttError::KeepAliveTimeout(
            KeepAliveTimeoutContext {
            }
        )
    }

    pub(crate) fn new_ack_timeout() -> Self {
        MqttError::AckTimeout(
            AckTimeoutContext {
            }
        )
    }

    pub(crate) fn new_subscription_failure(return_codes: Vec<SubscribeReturnCode>) -> Self {
        MqttError::SubscriptionFailure(
            SubscriptionFailureContext {
                return_codes
            }
        )
    }

    pub(crate) fn new_packet_validation(packet_type: PacketType, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::PacketValidation(
            PacketValidationContext {
                packet_type,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_session_store_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::SessionStoreFailure(
            SessionStoreFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_operation_channel_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::OperationChannelFailure(
            OperationChannelFailureContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.  Typically this should be
    /// an error surfacing from a third-party transport library.
    #[doc(hidden)]
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a StdIoError variant from an existing error.  Typically this should be a
    /// std::io::Error
    #[doc(hidden)]
    pub fn new_std_io_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::StdIoError(
            StdIoErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        MqttError::UserInitiatedDisconnect(
            UserInitiatedDisconnectContext {
            }
        )
    }

    pub(crate) fn new_client_closed() -> Self {
        MqttError::ClientClosed(
            ClientClosedContext {
            }
        )
    }
}

impl Error for MqttError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttError::EncodingFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::DecodingFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ProtocolError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ConnectionEstablishmentFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::PacketValidation(context) => {
                Some(context.source.as_ref())
            }
            MqttError::SessionStoreFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::OperationChannelFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::StdIoError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::EncodingFailure(_) => {
                write!(f, "failure encountered while encoding an outbound MQTT packet")
            }
            MqttError::DecodingFailure(_) => {
                write!(f, "failure encountered while decoding an incoming MQTT packet")
            }
            MqttError::ProtocolError(_) => {
                write!(f, "broker behavior disallowed by the mqtt spec")
            }
            MqttError::InternalStateError(_) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug")
            }
            MqttError::ConnectionClosed(_) => {
                write!(f, "client connection was closed; source contains further details")
            }
            MqttError::ConnectionEstablishmentFailure(_) => {
                write!(f, "failed to establish an MQTT connection to the broker")
            }
            MqttError::ConnectionRejected(context) => {
                write!(f, "broker rejected the connection attempt with CONNACK return code {} ({})", context.return_code as u8, connect_return_code_to_str(context.return_code))
            }
            MqttError::ConnackTimeout(_) => {
                write!(f, "no CONNACK arrived within the connect timeout interval")
            }
            MqttError::KeepAliveTimeout(_) => {
                write!(f, "keep alive interval elapsed with no response from the broker")
            }
            MqttError::AckTimeout(_) => {
                write!(f, "the operation's timeout triggered prior to receiving an ack from the broker")
            }
            MqttError::SubscriptionFailure(context) => {
                write!(f, "broker failed one or more subscription entries; return codes: {:?}", context.return_codes)
            }
            MqttError::PacketValidation(context) => {
                write!(f, "{} packet failed validation", context.packet_type)
            }
            MqttError::SessionStoreFailure(_) => {
                write!(f, "durable session record could not be stored or restored; source contains further details")
            }
            MqttError::OperationChannelFailure(_) => {
                write!(f, "failure encountered while sending/receiving on an MQTT operation-related channel")
            }
            MqttError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
            MqttError::StdIoError(_) => {
                write!(f, "generic error wrapper for std::io::Error when no more specialized error is appropriate")
            }
            MqttError::UserInitiatedDisconnect(_) => {
                write!(f, "connection was shut down by user action")
            }
            MqttError::ClientClosed(_) => {
                write!(f, "the operation was incomplete prior to the client being closed")
            }
        }
    }
}

impl From<std::io::Error> for MqttError {
    fn from(error: std::io::Error) -> Self {
        MqttError::new_std_io_error(error)
    }
}

impl From<core::str::Utf8Error> for MqttError {
    fn from(err: core::str::Utf8Error) -> Self {
        MqttError::new_decoding_failure(err)
    }
}

impl From<tungstenite::error::Error> for MqttError {
    fn from(err: tungstenite::error::Error) -> Self {
        MqttError::new_transport_error(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MqttError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        MqttError::new_operation_channel_failure(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type MqttResult<T> = Result<T, MqttError>;

pub(crate) fn fold_mqtt_result<T>(base: MqttResult<T>, new_result: MqttResult<T>) -> MqttResult<T> {
    new_result?;
    base
}
