/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::utils::*;
use crate::encode::*;
use crate::encode::utils::*;
use crate::error::{MqttError, MqttResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::publish::*;
use crate::mqtt::utils::*;

use log::*;
use std::collections::VecDeque;
use std::fmt;

const CONNECT_FLAG_CLEAN_SESSION: u8 = 1 << 1;
const CONNECT_FLAG_WILL: u8 = 1 << 2;
const CONNECT_FLAG_WILL_QOS_SHIFT: u8 = 3;
const CONNECT_FLAG_WILL_RETAIN: u8 = 1 << 5;
const CONNECT_FLAG_PASSWORD: u8 = 1 << 6;
const CONNECT_FLAG_USERNAME: u8 = 1 << 7;

/// Data model of an MQTT 3.x CONNECT packet.
///
/// The protocol name/level block is not part of the data model; it is derived from the
/// encoding context's protocol version.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {

    /// The maximum time interval, in seconds, that is permitted to elapse between the point at
    /// which the client finishes transmitting one control packet and the point it starts
    /// sending the next.  Zero disables keep alive processing.
    pub keep_alive_interval_seconds: u16,

    /// True if the server should discard any existing session state for this client id and
    /// not persist state from this connection.
    pub clean_session: bool,

    /// A unique string identifying the client to the server.  Used to restore session state
    /// between connections.  May be empty, in which case the server assigns an identity it has
    /// no way of communicating back.
    pub client_id: Option<String>,

    /// A string value that the server may use for client authentication and authorization.
    pub username: Option<String>,

    /// Opaque binary data that the server may use for client authentication and authorization.
    /// May only be present when a username is present.
    pub password: Option<Vec<u8>>,

    /// Message published by the server when this connection ends ungracefully.
    pub will: Option<PublishPacket>,
}

#[rustfmt::skip]
fn compute_connect_packet_length(packet: &ConnectPacket, protocol_version: ProtocolVersion) -> MqttResult<u32> {
    let mut total_remaining_length: usize =
        match protocol_version {
            ProtocolVersion::Mqtt31 => { 2 + PROTOCOL_NAME_31.len() + 1 }
            ProtocolVersion::Mqtt311 => { 2 + PROTOCOL_NAME_311.len() + 1 }
        };

    /* connect flags byte + keep alive interval */
    total_remaining_length += 3;

    add_optional_string_length!(total_remaining_length, packet.client_id);

    if let Some(will) = &packet.will {
        total_remaining_length += 2 + will.topic.len();
        total_remaining_length += 2 + will.payload.len();
    }

    if let Some(username) = &packet.username {
        total_remaining_length += 2 + username.len();
    }

    if let Some(password) = &packet.password {
        total_remaining_length += 2 + password.len();
    }

    compute_variable_length_integer_encode_size(total_remaining_length)?;

    Ok(total_remaining_length as u32)
}

fn compute_connect_flags(packet: &ConnectPacket) -> u8 {
    let mut flags: u8 = 0;
    if packet.clean_session {
        flags |= CONNECT_FLAG_CLEAN_SESSION;
    }

    if let Some(will) = &packet.will {
        flags |= CONNECT_FLAG_WILL;
        flags |= (will.qos as u8) << CONNECT_FLAG_WILL_QOS_SHIFT;

        if will.retain {
            flags |= CONNECT_FLAG_WILL_RETAIN;
        }
    }

    if packet.username.is_some() {
        flags |= CONNECT_FLAG_USERNAME;
    }

    if packet.password.is_some() {
        flags |= CONNECT_FLAG_PASSWORD;
    }

    flags
}

fn get_connect_packet_client_id(packet: &MqttPacket) -> &str {
    get_optional_packet_field!(packet, MqttPacket::Connect, client_id)
}

fn get_connect_packet_username(packet: &MqttPacket) -> &str {
    get_optional_packet_field!(packet, MqttPacket::Connect, username)
}

fn get_connect_packet_password(packet: &MqttPacket) -> &[u8] {
    get_optional_packet_field!(packet, MqttPacket::Connect, password)
}

fn get_connect_packet_will_topic(packet: &MqttPacket) -> &str {
    if let MqttPacket::Connect(connect) = packet {
        if let Some(will) = &connect.will {
            return &will.topic;
        }
    }

    panic!("Internal encoding error: invalid will topic state");
}

fn get_connect_packet_will_payload(packet: &MqttPacket) -> &[u8] {
    if let MqttPacket::Connect(connect) = packet {
        if let Some(will) = &connect.will {
            return &will.payload;
        }
    }

    panic!("Internal encoding error: invalid will payload state");
}

#[rustfmt::skip]
pub(crate) fn write_connect_encoding_steps(packet: &ConnectPacket, context: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    let total_remaining_length = compute_connect_packet_length(packet, context.protocol_version)?;

    encode_integral_expression!(steps, Uint8, CONNECT_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, total_remaining_length);

    let (protocol_name, protocol_level) =
        match context.protocol_version {
            ProtocolVersion::Mqtt31 => { (PROTOCOL_NAME_31, PROTOCOL_LEVEL_31) }
            ProtocolVersion::Mqtt311 => { (PROTOCOL_NAME_311, PROTOCOL_LEVEL_311) }
        };

    encode_integral_expression!(steps, Uint16, protocol_name.len() as u16);
    steps.push_back(EncodingStep::StaticString(protocol_name, 0));
    encode_integral_expression!(steps, Uint8, protocol_level);

    encode_integral_expression!(steps, Uint8, compute_connect_flags(packet));
    encode_integral_expression!(steps, Uint16, packet.keep_alive_interval_seconds);

    encode_length_prefixed_optional_string!(steps, get_connect_packet_client_id, packet.client_id);

    if let Some(will) = &packet.will {
        encode_length_prefixed_string!(steps, get_connect_packet_will_topic, will.topic);
        encode_length_prefixed_bytes!(steps, get_connect_packet_will_payload, will.payload);
    }

    if let Some(username) = &packet.username {
        encode_length_prefixed_string!(steps, get_connect_packet_username, username);
    }

    if let Some(password) = &packet.password {
        encode_length_prefixed_bytes!(steps, get_connect_packet_password, password);
    }

    Ok(())
}

pub(crate) fn decode_connect_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != CONNECT_FIRST_BYTE {
        error!("ConnectPacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for connect packet"));
    }

    let mut packet = ConnectPacket { ..Default::default() };

    let mut mutable_body = packet_body;

    let mut protocol_name = String::new();
    mutable_body = decode_length_prefixed_string(mutable_body, &mut protocol_name)?;

    let mut protocol_level: u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut protocol_level)?;

    match (protocol_name.as_str(), protocol_level) {
        (PROTOCOL_NAME_31, PROTOCOL_LEVEL_31) | (PROTOCOL_NAME_311, PROTOCOL_LEVEL_311) => {}
        _ => {
            error!("ConnectPacket Decode - unsupported protocol name/level ({}, {})", protocol_name, protocol_level);
            return Err(MqttError::new_decoding_failure("unsupported protocol name/level pair in connect packet"));
        }
    }

    let mut flags: u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut flags)?;
    if (flags & 0x01) != 0 {
        error!("ConnectPacket Decode - reserved connect flag bit set");
        return Err(MqttError::new_decoding_failure("reserved connect flag bit set"));
    }

    packet.clean_session = (flags & CONNECT_FLAG_CLEAN_SESSION) != 0;

    mutable_body = decode_u16(mutable_body, &mut packet.keep_alive_interval_seconds)?;

    let mut client_id = String::new();
    mutable_body = decode_length_prefixed_string(mutable_body, &mut client_id)?;
    packet.client_id = Some(client_id);

    let will_qos = (flags >> CONNECT_FLAG_WILL_QOS_SHIFT) & 0x03;
    if (flags & CONNECT_FLAG_WILL) != 0 {
        let mut will = PublishPacket {
            qos: convert_u8_to_quality_of_service(will_qos)?,
            retain: (flags & CONNECT_FLAG_WILL_RETAIN) != 0,
            ..Default::default()
        };

        mutable_body = decode_length_prefixed_string(mutable_body, &mut will.topic)?;

        let mut will_payload: Option<Vec<u8>> = None;
        mutable_body = decode_optional_length_prefixed_bytes(mutable_body, &mut will_payload)?;
        will.payload = will_payload.unwrap_or_default();

        packet.will = Some(will);
    } else if will_qos != 0 || (flags & CONNECT_FLAG_WILL_RETAIN) != 0 {
        error!("ConnectPacket Decode - will flags set without a will");
        return Err(MqttError::new_decoding_failure("will flags set without a will"));
    }

    if (flags & CONNECT_FLAG_USERNAME) != 0 {
        mutable_body = decode_optional_length_prefixed_string(mutable_body, &mut packet.username)?;
    }

    if (flags & CONNECT_FLAG_PASSWORD) != 0 {
        if (flags & CONNECT_FLAG_USERNAME) == 0 {
            error!("ConnectPacket Decode - password flag set without username flag");
            return Err(MqttError::new_decoding_failure("password flag set without username flag"));
        }

        mutable_body = decode_optional_length_prefixed_bytes(mutable_body, &mut packet.password)?;
    }

    if !mutable_body.is_empty() {
        error!("ConnectPacket Decode - packet bytes remain after payload fields");
        return Err(MqttError::new_decoding_failure("nonzero remaining bytes after connect payload"));
    }

    Ok(Box::new(MqttPacket::Connect(packet)))
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        log_primitive_value!(self.keep_alive_interval_seconds, f, "keep_alive_interval_seconds");
        log_primitive_value!(self.clean_session, f, "clean_session");
        log_optional_string!(self.client_id, f, "client_id", value);
        log_optional_string!(self.username, f, "username", value);
        log_optional_binary_data_sensitive!(self.password, f, "password");
        if let Some(will) = &self.will {
            write!(f, " will: {}", will)?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    fn create_connect_all_fields() -> ConnectPacket {
        ConnectPacket {
            keep_alive_interval_seconds: 60,
            clean_session: false,
            client_id: Some("sensor-fleet-17".to_string()),
            username: Some("a-user".to_string()),
            password: Some("a-password".as_bytes().to_vec()),
            will: Some(PublishPacket {
                topic: "status/last-will".to_string(),
                qos: QualityOfService::AtLeastOnce,
                retain: true,
                payload: "went away".as_bytes().to_vec(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn connect_round_trip_encode_decode_default() {
        let packet = ConnectPacket {
            client_id: Some(String::new()),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connect(packet)));
    }

    #[test]
    fn connect_round_trip_encode_decode_basic() {
        let packet = ConnectPacket {
            keep_alive_interval_seconds: 60,
            clean_session: true,
            client_id: Some("reader-1".to_string()),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connect(packet)));
    }

    #[test]
    fn connect_round_trip_encode_decode_all_fields() {
        let packet = create_connect_all_fields();
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connect(packet)));
    }

    #[test]
    fn connect_round_trip_encode_decode_all_fields_31() {
        let packet = create_connect_all_fields();
        assert!(do_round_trip_encode_decode_test_for_version(&MqttPacket::Connect(packet), ProtocolVersion::Mqtt31));
    }

    #[test]
    fn connect_decode_failure_bad_fixed_header() {
        let packet = ConnectPacket {
            client_id: Some("reader-1".to_string()),
            ..Default::default()
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Connect(packet), 4);
    }

    #[test]
    fn connect_decode_failure_reserved_flag_set() {
        let packet = ConnectPacket {
            keep_alive_interval_seconds: 30,
            client_id: Some("reader-1".to_string()),
            ..Default::default()
        };

        let set_reserved_connect_flag = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // fixed header (2) + protocol name (6) + level (1) puts the connect flags at index 9
            clone[9] |= 0x01;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connect(packet), set_reserved_connect_flag);
    }

    #[test]
    fn connect_decode_failure_bad_protocol_level() {
        let packet = ConnectPacket {
            client_id: Some("reader-1".to_string()),
            ..Default::default()
        };

        let corrupt_protocol_level = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[8] = 5;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connect(packet), corrupt_protocol_level);
    }
}
