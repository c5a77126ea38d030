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

/// Data model of an MQTT 3.x DISCONNECT packet.  Only ever sent client-to-server; a broker
/// that sends one is violating the protocol.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {}

#[rustfmt::skip]
pub(crate) fn write_disconnect_encoding_steps(_: &DisconnectPacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    encode_integral_expression!(steps, Uint8, DISCONNECT_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, 0);

    Ok(())
}

pub(crate) fn decode_disconnect_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != DISCONNECT_FIRST_BYTE {
        error!("DisconnectPacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for disconnect packet"));
    }

    if !packet_body.is_empty() {
        error!("DisconnectPacket Decode - nonzero remaining length");
        return Err(MqttError::new_decoding_failure("nonzero remaining length for disconnect packet"));
    }

    Ok(Box::new(MqttPacket::Disconnect(DisconnectPacket {})))
}

impl fmt::Display for DisconnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DisconnectPacket {{ }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn disconnect_round_trip_encode_decode() {
        let packet = DisconnectPacket {};

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet)));
    }

    #[test]
    fn disconnect_decode_failure_bad_fixed_header() {
        let packet = DisconnectPacket {};

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Disconnect(packet), 2);
    }
}
