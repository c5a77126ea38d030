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

/// Data model of an MQTT 3.x PUBREL packet: the sender's release of a QoS 2 publish whose
/// PUBREC has been seen.  Carries mandatory 0x02 fixed header flags.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {

    /// Id of the QoS 2 publish being released
    pub packet_id: u16,
}

define_ack_packet_encoding_impl!(write_pubrel_encoding_steps, PubrelPacket, PUBREL_FIRST_BYTE);
define_ack_packet_decode_function!(decode_pubrel_packet, Pubrel, PubrelPacket, "PubrelPacket", PUBREL_FIRST_BYTE);
define_ack_packet_display_trait!(PubrelPacket, "PubrelPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubrel_round_trip_encode_decode() {
        let packet = PubrelPacket {
            packet_id: 444,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubrel(packet)));
    }

    #[test]
    fn pubrel_decode_failure_missing_mandatory_flags() {
        let packet = PubrelPacket {
            packet_id: 444,
        };

        let clear_mandatory_flags = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[0] &= 0xF0;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Pubrel(packet), clear_mandatory_flags);
    }
}
