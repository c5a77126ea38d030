/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Utility functions related to the MQTT 3.x data model: conversion, display, constants.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

use log::*;

pub(crate) const PACKET_TYPE_CONNECT: u8 = 1;
pub(crate) const PACKET_TYPE_CONNACK: u8 = 2;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = 3;
pub(crate) const PACKET_TYPE_PUBACK: u8 = 4;
pub(crate) const PACKET_TYPE_PUBREC: u8 = 5;
pub(crate) const PACKET_TYPE_PUBREL: u8 = 6;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = 7;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = 9;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = 11;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = 12;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = 13;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = 14;

pub(crate) const CONNECT_FIRST_BYTE: u8 = PACKET_TYPE_CONNECT << 4;
pub(crate) const CONNACK_FIRST_BYTE: u8 = PACKET_TYPE_CONNACK << 4;
pub(crate) const PUBACK_FIRST_BYTE: u8 = PACKET_TYPE_PUBACK << 4;
pub(crate) const PUBREC_FIRST_BYTE: u8 = PACKET_TYPE_PUBREC << 4;

// SUBSCRIBE, UNSUBSCRIBE and PUBREL carry mandatory 0x02 fixed header flags
pub(crate) const PUBREL_FIRST_BYTE: u8 = (PACKET_TYPE_PUBREL << 4) | 0x02;
pub(crate) const PUBCOMP_FIRST_BYTE: u8 = PACKET_TYPE_PUBCOMP << 4;
pub(crate) const SUBSCRIBE_FIRST_BYTE: u8 = (PACKET_TYPE_SUBSCRIBE << 4) | 0x02;
pub(crate) const SUBACK_FIRST_BYTE: u8 = PACKET_TYPE_SUBACK << 4;
pub(crate) const UNSUBSCRIBE_FIRST_BYTE: u8 = (PACKET_TYPE_UNSUBSCRIBE << 4) | 0x02;
pub(crate) const UNSUBACK_FIRST_BYTE: u8 = PACKET_TYPE_UNSUBACK << 4;
pub(crate) const PINGREQ_FIRST_BYTE: u8 = PACKET_TYPE_PINGREQ << 4;
pub(crate) const PINGRESP_FIRST_BYTE: u8 = PACKET_TYPE_PINGRESP << 4;
pub(crate) const DISCONNECT_FIRST_BYTE: u8 = PACKET_TYPE_DISCONNECT << 4;

pub(crate) const PROTOCOL_NAME_31: &str = "MQIsdp";
pub(crate) const PROTOCOL_LEVEL_31: u8 = 3;
pub(crate) const PROTOCOL_NAME_311: &str = "MQTT";
pub(crate) const PROTOCOL_LEVEL_311: u8 = 4;

/// Converts a u8 to a quality of service value, failing if the value is out of range
pub fn convert_u8_to_quality_of_service(value: u8) -> MqttResult<QualityOfService> {
    match value {
        0 => { Ok(QualityOfService::AtMostOnce) }
        1 => { Ok(QualityOfService::AtLeastOnce) }
        2 => { Ok(QualityOfService::ExactlyOnce) }
        _ => {
            error!("Packet Decode - Invalid quality of service value ({})", value);
            Err(MqttError::new_decoding_failure("invalid quality of service value"))
        }
    }
}

/// Converts a u8 to a CONNACK return code, failing if the value is out of range
pub fn convert_u8_to_connect_return_code(value: u8) -> MqttResult<ConnectReturnCode> {
    match value {
        0 => { Ok(ConnectReturnCode::Accepted) }
        1 => { Ok(ConnectReturnCode::UnacceptableProtocolVersion) }
        2 => { Ok(ConnectReturnCode::IdentifierRejected) }
        3 => { Ok(ConnectReturnCode::ServerUnavailable) }
        4 => { Ok(ConnectReturnCode::BadUsernameOrPassword) }
        5 => { Ok(ConnectReturnCode::NotAuthorized) }
        _ => {
            error!("Packet Decode - Invalid connect return code ({})", value);
            Err(MqttError::new_decoding_failure("invalid connect return code"))
        }
    }
}

/// Converts a u8 to a SUBACK per-topic return code, failing if the value is out of range
pub fn convert_u8_to_subscribe_return_code(value: u8) -> MqttResult<SubscribeReturnCode> {
    match value {
        0 => { Ok(SubscribeReturnCode::GrantedQos0) }
        1 => { Ok(SubscribeReturnCode::GrantedQos1) }
        2 => { Ok(SubscribeReturnCode::GrantedQos2) }
        128 => { Ok(SubscribeReturnCode::Failure) }
        _ => {
            error!("Packet Decode - Invalid subscribe return code ({})", value);
            Err(MqttError::new_decoding_failure("invalid subscribe return code"))
        }
    }
}

pub(crate) fn quality_of_service_to_str(qos: QualityOfService) -> &'static str {
    match qos {
        QualityOfService::AtMostOnce => { "AtMostOnce (0)" }
        QualityOfService::AtLeastOnce => { "AtLeastOnce (1)" }
        QualityOfService::ExactlyOnce => { "ExactlyOnce (2)" }
    }
}

/// The standard human-readable reason strings for CONNACK return codes.
pub fn connect_return_code_to_str(return_code: ConnectReturnCode) -> &'static str {
    match return_code {
        ConnectReturnCode::Accepted => { "Connection Accepted" }
        ConnectReturnCode::UnacceptableProtocolVersion => { "Connection Refused: unacceptable protocol version" }
        ConnectReturnCode::IdentifierRejected => { "Connection Refused: identifier rejected" }
        ConnectReturnCode::ServerUnavailable => { "Connection Refused: server unavailable" }
        ConnectReturnCode::BadUsernameOrPassword => { "Connection Refused: bad user name or password" }
        ConnectReturnCode::NotAuthorized => { "Connection Refused: not authorized" }
    }
}

pub(crate) fn packet_type_to_str(packet_type: u8) -> &'static str {
    match packet_type {
        PACKET_TYPE_CONNECT => { "CONNECT" }
        PACKET_TYPE_CONNACK => { "CONNACK" }
        PACKET_TYPE_PUBLISH => { "PUBLISH" }
        PACKET_TYPE_PUBACK => { "PUBACK" }
        PACKET_TYPE_PUBREC => { "PUBREC" }
        PACKET_TYPE_PUBREL => { "PUBREL" }
        PACKET_TYPE_PUBCOMP => { "PUBCOMP" }
        PACKET_TYPE_SUBSCRIBE => { "SUBSCRIBE" }
        PACKET_TYPE_SUBACK => { "SUBACK" }
        PACKET_TYPE_UNSUBSCRIBE => { "UNSUBSCRIBE" }
        PACKET_TYPE_UNSUBACK => { "UNSUBACK" }
        PACKET_TYPE_PINGREQ => { "PINGREQ" }
        PACKET_TYPE_PINGRESP => { "PINGRESP" }
        PACKET_TYPE_DISCONNECT => { "DISCONNECT" }
        _ => { "UNKNOWN" }
    }
}

pub(crate) fn mqtt_packet_to_str(packet: &MqttPacket) -> &'static str {
    match packet {
        MqttPacket::Connect(_) => { "CONNECT" }
        MqttPacket::Connack(_) => { "CONNACK" }
        MqttPacket::Publish(_) => { "PUBLISH" }
        MqttPacket::Puback(_) => { "PUBACK" }
        MqttPacket::Pubrec(_) => { "PUBREC" }
        MqttPacket::Pubrel(_) => { "PUBREL" }
        MqttPacket::Pubcomp(_) => { "PUBCOMP" }
        MqttPacket::Subscribe(_) => { "SUBSCRIBE" }
        MqttPacket::Suback(_) => { "SUBACK" }
        MqttPacket::Unsubscribe(_) => { "UNSUBSCRIBE" }
        MqttPacket::Unsuback(_) => { "UNSUBACK" }
        MqttPacket::Pingreq(_) => { "PINGREQ" }
        MqttPacket::Pingresp(_) => { "PINGRESP" }
        MqttPacket::Disconnect(_) => { "DISCONNECT" }
    }
}

pub(crate) fn mqtt_packet_to_packet_type(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => { PacketType::Connect }
        MqttPacket::Connack(_) => { PacketType::Connack }
        MqttPacket::Publish(_) => { PacketType::Publish }
        MqttPacket::Puback(_) => { PacketType::Puback }
        MqttPacket::Pubrec(_) => { PacketType::Pubrec }
        MqttPacket::Pubrel(_) => { PacketType::Pubrel }
        MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
        MqttPacket::Subscribe(_) => { PacketType::Subscribe }
        MqttPacket::Suback(_) => { PacketType::Suback }
        MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        MqttPacket::Unsuback(_) => { PacketType::Unsuback }
        MqttPacket::Pingreq(_) => { PacketType::Pingreq }
        MqttPacket::Pingresp(_) => { PacketType::Pingresp }
        MqttPacket::Disconnect(_) => { PacketType::Disconnect }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_return_code_conversions() {
        for value in 0u8..=5u8 {
            let return_code = convert_u8_to_connect_return_code(value).unwrap();
            assert_eq!(value, return_code as u8);
        }

        assert!(convert_u8_to_connect_return_code(6).is_err());
        assert!(convert_u8_to_connect_return_code(255).is_err());
    }

    #[test]
    fn subscribe_return_code_conversions() {
        assert_eq!(SubscribeReturnCode::GrantedQos0, convert_u8_to_subscribe_return_code(0).unwrap());
        assert_eq!(SubscribeReturnCode::GrantedQos1, convert_u8_to_subscribe_return_code(1).unwrap());
        assert_eq!(SubscribeReturnCode::GrantedQos2, convert_u8_to_subscribe_return_code(2).unwrap());
        assert_eq!(SubscribeReturnCode::Failure, convert_u8_to_subscribe_return_code(128).unwrap());
        assert!(convert_u8_to_subscribe_return_code(3).is_err());
        assert!(convert_u8_to_subscribe_return_code(127).is_err());
    }

    #[test]
    fn quality_of_service_conversions() {
        assert_eq!(QualityOfService::AtMostOnce, convert_u8_to_quality_of_service(0).unwrap());
        assert_eq!(QualityOfService::AtLeastOnce, convert_u8_to_quality_of_service(1).unwrap());
        assert_eq!(QualityOfService::ExactlyOnce, convert_u8_to_quality_of_service(2).unwrap());
        assert!(convert_u8_to_quality_of_service(3).is_err());
    }
}
