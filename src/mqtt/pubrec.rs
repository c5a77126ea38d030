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

/// Data model of an MQTT 3.x PUBREC packet: the receiver's half-acknowledgement of a QoS 2
/// publish.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {

    /// Id of the QoS 2 publish this packet is acknowledging receipt of
    pub packet_id: u16,
}

define_ack_packet_encoding_impl!(write_pubrec_encoding_steps, PubrecPacket, PUBREC_FIRST_BYTE);
define_ack_packet_decode_function!(decode_pubrec_packet, Pubrec, PubrecPacket, "PubrecPacket", PUBREC_FIRST_BYTE);
define_ack_packet_display_trait!(PubrecPacket, "PubrecPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubrec_round_trip_encode_decode() {
        let packet = PubrecPacket {
            packet_id: 32000,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubrec(packet)));
    }

    #[test]
    fn pubrec_decode_failure_bad_fixed_header() {
        let packet = PubrecPacket {
            packet_id: 32000,
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Pubrec(packet), 12);
    }
}
