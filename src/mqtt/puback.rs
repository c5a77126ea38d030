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

/// Data model of an MQTT 3.x PUBACK packet: the full acknowledgement of a QoS 1 publish.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {

    /// Id of the QoS 1 publish this packet is acknowledging
    pub packet_id: u16,
}

define_ack_packet_encoding_impl!(write_puback_encoding_steps, PubackPacket, PUBACK_FIRST_BYTE);
define_ack_packet_decode_function!(decode_puback_packet, Puback, PubackPacket, "PubackPacket", PUBACK_FIRST_BYTE);
define_ack_packet_display_trait!(PubackPacket, "PubackPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn puback_round_trip_encode_decode() {
        let packet = PubackPacket {
            packet_id: 123,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet)));
    }

    #[test]
    fn puback_decode_failure_bad_fixed_header() {
        let packet = PubackPacket {
            packet_id: 123,
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Puback(packet), 7);
    }
}
