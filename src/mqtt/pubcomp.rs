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

/// Data model of an MQTT 3.x PUBCOMP packet: the final acknowledgement of a QoS 2 publish.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {

    /// Id of the QoS 2 publish whose delivery sequence is complete
    pub packet_id: u16,
}

define_ack_packet_encoding_impl!(write_pubcomp_encoding_steps, PubcompPacket, PUBCOMP_FIRST_BYTE);
define_ack_packet_decode_function!(decode_pubcomp_packet, Pubcomp, PubcompPacket, "PubcompPacket", PUBCOMP_FIRST_BYTE);
define_ack_packet_display_trait!(PubcompPacket, "PubcompPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubcomp_round_trip_encode_decode() {
        let packet = PubcompPacket {
            packet_id: 9999,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubcomp(packet)));
    }

    #[test]
    fn pubcomp_decode_failure_bad_fixed_header() {
        let packet = PubcompPacket {
            packet_id: 9999,
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Pubcomp(packet), 3);
    }
}
