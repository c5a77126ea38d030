/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::utils::*;
use crate::encode::*;
use crate::encode::utils::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;
use std::collections::VecDeque;
use std::fmt;

/// Data model of an MQTT 3.x PINGREQ packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

#[rustfmt::skip]
pub(crate) fn write_pingreq_encoding_steps(_: &PingreqPacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    encode_integral_expression!(steps, Uint8, PINGREQ_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, 0);

    Ok(())
}

pub(crate) fn decode_pingreq_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != PINGREQ_FIRST_BYTE {
        error!("PingreqPacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for pingreq packet"));
    }

    if !packet_body.is_empty() {
        error!("PingreqPacket Decode - nonzero remaining length");
        return Err(MqttError::new_decoding_failure("nonzero remaining length for pingreq packet"));
    }

    Ok(Box::new(MqttPacket::Pingreq(PingreqPacket {})))
}

impl fmt::Display for PingreqPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingreqPacket {{ }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pingreq_round_trip_encode_decode() {
        let packet = PingreqPacket {};

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pingreq(packet)));
    }

    #[test]
    fn pingreq_decode_failure_nonzero_remaining_length() {
        let packet = PingreqPacket {};

        let pad_remaining_length = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] = 2;
            clone.push(0);
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Pingreq(packet), pad_remaining_length);
    }
}
