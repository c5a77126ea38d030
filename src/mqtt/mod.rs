/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model the MQTT 3.1/3.1.1 specification.
 */

use std::fmt;
use crate::error::MqttError;

pub(crate) mod connack;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod pingreq;
pub(crate) mod pingresp;
pub(crate) mod puback;
pub(crate) mod pubcomp;
pub(crate) mod publish;
pub(crate) mod pubrec;
pub(crate) mod pubrel;
pub(crate) mod suback;
pub(crate) mod subscribe;
pub(crate) mod unsuback;
pub(crate) mod unsubscribe;
pub mod utils;

/// MQTT message delivery quality of service.
///
/// Enum values match the encoding values used on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No
    /// response is sent by the receiver and no retry is performed by the sender. The message
    /// arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_quality_of_service(value)
    }
}

/// Wire protocol revision spoken with the broker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProtocolVersion {

    /// MQTT 3.1 - protocol name `MQIsdp`, protocol level 3
    Mqtt31,

    /// MQTT 3.1.1 - protocol name `MQTT`, protocol level 4
    #[default]
    Mqtt311,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Mqtt31 => { write!(f, "Mqtt31") }
            ProtocolVersion::Mqtt311 => { write!(f, "Mqtt311") }
        }
    }
}

/// Server return code for connection attempts.
///
/// Enum values match the CONNACK encoding values of the MQTT 3.1.1 spec.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReturnCode {

    /// Returned when the connection is accepted.
    #[default]
    Accepted = 0,

    /// Returned when the server does not support the level of the MQTT protocol requested
    /// by the client.
    UnacceptableProtocolVersion = 1,

    /// Returned when the client identifier is correct UTF-8 but not allowed by the server.
    IdentifierRejected = 2,

    /// Returned when the network connection has been made but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// Returned when the data in the user name or password is malformed.
    BadUsernameOrPassword = 4,

    /// Returned when the client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Returns whether or not the return code represents a successful connect
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReturnCode::Accepted)
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_connect_return_code(value)
    }
}

/// Per-topic result inside SUBACK packets.
///
/// Enum values match the SUBACK payload encoding values; `0x80` marks a failed subscription
/// entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubscribeReturnCode {

    /// The subscription was accepted and the maximum QoS sent will be QoS 0.
    #[default]
    GrantedQos0 = 0,

    /// The subscription was accepted and the maximum QoS sent will be QoS 1.
    GrantedQos1 = 1,

    /// The subscription was accepted and the maximum QoS sent will be QoS 2.
    GrantedQos2 = 2,

    /// The subscription was refused by the server.
    Failure = 128,
}

impl SubscribeReturnCode {
    /// Returns whether or not the return code represents a failed subscription entry
    pub fn is_failure(&self) -> bool {
        matches!(self, SubscribeReturnCode::Failure)
    }
}

/// A single entry in a SUBSCRIBE packet's payload: a topic filter and the maximum QoS the
/// client is willing to receive matching messages at.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {

    /// Topic filter to subscribe to
    pub topic_filter: String,

    /// Maximum QoS on messages the server may send the client on this subscription
    pub qos: QualityOfService,
}

impl Subscription {

    /// Creates a new subscription within a Subscribe operation
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos
        }
    }
}

/// MQTT control packet type, in wire encoding order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => { write!(f, "ConnectPacket") }
            PacketType::Connack => { write!(f, "ConnackPacket") }
            PacketType::Publish => { write!(f, "PublishPacket") }
            PacketType::Puback => { write!(f, "PubackPacket") }
            PacketType::Pubrec => { write!(f, "PubrecPacket") }
            PacketType::Pubrel => { write!(f, "PubrelPacket") }
            PacketType::Pubcomp => { write!(f, "PubcompPacket") }
            PacketType::Subscribe => { write!(f, "SubscribePacket") }
            PacketType::Suback => { write!(f, "SubackPacket") }
            PacketType::Unsubscribe => { write!(f, "UnsubscribePacket") }
            PacketType::Unsuback => { write!(f, "UnsubackPacket") }
            PacketType::Pingreq => { write!(f, "PingreqPacket") }
            PacketType::Pingresp => { write!(f, "PingrespPacket") }
            PacketType::Disconnect => { write!(f, "DisconnectPacket") }
        }
    }
}

/// Algebraic union of all MQTT 3.x packet types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttPacket {
    Connect(connect::ConnectPacket),
    Connack(connack::ConnackPacket),
    Publish(publish::PublishPacket),
    Puback(puback::PubackPacket),
    Pubrec(pubrec::PubrecPacket),
    Pubrel(pubrel::PubrelPacket),
    Pubcomp(pubcomp::PubcompPacket),
    Subscribe(subscribe::SubscribePacket),
    Suback(suback::SubackPacket),
    Unsubscribe(unsubscribe::UnsubscribePacket),
    Unsuback(unsuback::UnsubackPacket),
    Pingreq(pingreq::PingreqPacket),
    Pingresp(pingresp::PingrespPacket),
    Disconnect(disconnect::DisconnectPacket),
}
