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

/// Data model of an MQTT 3.x SUBACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {

    /// Id of the subscribe this packet is acknowledging
    pub packet_id: u16,

    /// A list of return codes indicating the result of each individual subscription entry in
    /// the associated SUBSCRIBE packet.  `Failure` marks a refused entry.
    pub return_codes: Vec<SubscribeReturnCode>,
}

fn compute_suback_packet_length(packet: &SubackPacket) -> MqttResult<u32> {
    let total_remaining_length: usize = 2 + packet.return_codes.len();

    compute_variable_length_integer_encode_size(total_remaining_length)?;

    Ok(total_remaining_length as u32)
}

#[rustfmt::skip]
pub(crate) fn write_suback_encoding_steps(packet: &SubackPacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    let total_remaining_length = compute_suback_packet_length(packet)?;

    encode_integral_expression!(steps, Uint8, SUBACK_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, total_remaining_length);

    encode_integral_expression!(steps, Uint16, packet.packet_id);

    for return_code in &packet.return_codes {
        encode_enum!(steps, Uint8, u8, *return_code);
    }

    Ok(())
}

pub(crate) fn decode_suback_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != SUBACK_FIRST_BYTE {
        error!("SubackPacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for suback packet"));
    }

    let mut packet = SubackPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    if mutable_body.is_empty() {
        error!("SubackPacket Decode - empty return code payload");
        return Err(MqttError::new_decoding_failure("suback packet must contain at least one return code"));
    }

    packet.return_codes.reserve(mutable_body.len());
    for payload_byte in mutable_body.iter() {
        packet.return_codes.push(convert_u8_to_subscribe_return_code(*payload_byte)?);
    }

    Ok(Box::new(MqttPacket::Suback(packet)))
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " return_codes: [")?;
        for (i, return_code) in self.return_codes.iter().enumerate() {
            write!(f, " {}: {:?}", i, return_code)?;
        }
        write!(f, " ]")?;
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn suback_round_trip_encode_decode_required() {
        let packet = SubackPacket {
            packet_id: 1023,
            return_codes: vec![
                SubscribeReturnCode::GrantedQos1,
                SubscribeReturnCode::Failure,
                SubscribeReturnCode::GrantedQos0,
            ],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Suback(packet)));
    }

    #[test]
    fn suback_round_trip_encode_decode_many_codes() {
        let packet = SubackPacket {
            packet_id: 999,
            return_codes: vec![SubscribeReturnCode::GrantedQos2; 257],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Suback(packet)));
    }

    #[test]
    fn suback_decode_failure_bad_fixed_header() {
        let packet = SubackPacket {
            packet_id: 1023,
            return_codes: vec![
                SubscribeReturnCode::GrantedQos1,
            ],
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Suback(packet), 15);
    }

    #[test]
    fn suback_decode_failure_return_code_invalid() {
        let packet = SubackPacket {
            packet_id: 1023,
            return_codes: vec![
                SubscribeReturnCode::GrantedQos1,
            ],
        };

        let corrupt_return_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // fixed header (2) + packet id (2) puts the first return code at index 4
            clone[4] = 196;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Suback(packet), corrupt_return_code);
    }
}
