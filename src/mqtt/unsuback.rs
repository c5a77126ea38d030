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

/// Data model of an MQTT 3.x UNSUBACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {

    /// Id of the unsubscribe this packet is acknowledging
    pub packet_id: u16,
}

define_ack_packet_encoding_impl!(write_unsuback_encoding_steps, UnsubackPacket, UNSUBACK_FIRST_BYTE);
define_ack_packet_decode_function!(decode_unsuback_packet, Unsuback, UnsubackPacket, "UnsubackPacket", UNSUBACK_FIRST_BYTE);
define_ack_packet_display_trait!(UnsubackPacket, "UnsubackPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn unsuback_round_trip_encode_decode() {
        let packet = UnsubackPacket {
            packet_id: 47,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsuback(packet)));
    }

    #[test]
    fn unsuback_decode_failure_bad_fixed_header() {
        let packet = UnsubackPacket {
            packet_id: 47,
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Unsuback(packet), 5);
    }
}
