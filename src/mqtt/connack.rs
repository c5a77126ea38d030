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
use crate::mqtt::utils::*;

use log::*;
use std::collections::VecDeque;
use std::fmt;

const CONNACK_REMAINING_LENGTH: u32 = 2;
const CONNACK_SESSION_PRESENT_FLAG: u8 = 0x01;

/// Data model of an MQTT 3.x CONNACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {

    /// True if the server already holds session state for this client id (3.1.1 only; always
    /// false when speaking 3.1).
    pub session_present: bool,

    /// Result of the connection attempt.
    pub return_code: ConnectReturnCode,
}

#[rustfmt::skip]
pub(crate) fn write_connack_encoding_steps(packet: &ConnackPacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    encode_integral_expression!(steps, Uint8, CONNACK_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, CONNACK_REMAINING_LENGTH);

    encode_integral_expression!(steps, Uint8, if packet.session_present { CONNACK_SESSION_PRESENT_FLAG } else { 0 });
    encode_enum!(steps, Uint8, u8, packet.return_code);

    Ok(())
}

pub(crate) fn decode_connack_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != CONNACK_FIRST_BYTE {
        error!("ConnackPacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for connack packet"));
    }

    if packet_body.len() != CONNACK_REMAINING_LENGTH as usize {
        error!("ConnackPacket Decode - invalid remaining length");
        return Err(MqttError::new_decoding_failure("invalid remaining length for connack packet"));
    }

    let mut packet = ConnackPacket { ..Default::default() };

    let mut acknowledge_flags: u8 = 0;
    let mut mutable_body = packet_body;
    mutable_body = decode_u8(mutable_body, &mut acknowledge_flags)?;
    if (acknowledge_flags & !CONNACK_SESSION_PRESENT_FLAG) != 0 {
        error!("ConnackPacket Decode - reserved connect acknowledge flag bits set");
        return Err(MqttError::new_decoding_failure("reserved connect acknowledge flag bits set"));
    }

    packet.session_present = (acknowledge_flags & CONNACK_SESSION_PRESENT_FLAG) != 0;

    decode_u8_as_enum(mutable_body, &mut packet.return_code, convert_u8_to_connect_return_code)?;

    Ok(Box::new(MqttPacket::Connack(packet)))
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        log_primitive_value!(self.session_present, f, "session_present");
        log_enum!(self.return_code, f, "return_code", connect_return_code_to_str);
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn connack_round_trip_encode_decode_default() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
    }

    #[test]
    fn connack_round_trip_encode_decode_session_present() {
        let packet = ConnackPacket {
            session_present: true,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
    }

    #[test]
    fn connack_round_trip_encode_decode_all_return_codes() {
        let return_codes = vec![
            ConnectReturnCode::Accepted,
            ConnectReturnCode::UnacceptableProtocolVersion,
            ConnectReturnCode::IdentifierRejected,
            ConnectReturnCode::ServerUnavailable,
            ConnectReturnCode::BadUsernameOrPassword,
            ConnectReturnCode::NotAuthorized,
        ];

        for return_code in return_codes {
            let packet = ConnackPacket {
                session_present: false,
                return_code,
            };

            assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
        }
    }

    #[test]
    fn connack_decode_failure_bad_fixed_header() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Connack(packet), 9);
    }

    #[test]
    fn connack_decode_failure_reserved_acknowledge_flags() {
        let packet = ConnackPacket {
            session_present: true,
            ..Default::default()
        };

        let corrupt_acknowledge_flags = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[2] |= 0x40;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connack(packet), corrupt_acknowledge_flags);
    }

    #[test]
    fn connack_decode_failure_invalid_return_code() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        let corrupt_return_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[3] = 77;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connack(packet), corrupt_return_code);
    }
}
