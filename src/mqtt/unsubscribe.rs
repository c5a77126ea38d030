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

/// Data model of an MQTT 3.x UNSUBSCRIBE packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {

    /// Packet id bound to this unsubscribe while it is in flight.
    pub packet_id: u16,

    /// List of topic filters the client wishes to stop receiving messages for.  Must be
    /// non-empty.
    pub topic_filters: Vec<String>,
}

impl UnsubscribePacket {

    /// Creates a new unsubscribe for a single topic filter
    pub fn new(topic_filter: &str) -> Self {
        UnsubscribePacket {
            topic_filters: vec![topic_filter.to_string()],
            ..Default::default()
        }
    }
}

fn compute_unsubscribe_packet_length(packet: &UnsubscribePacket) -> MqttResult<u32> {
    let mut total_remaining_length: usize = 2;

    for topic_filter in &packet.topic_filters {
        total_remaining_length += 2 + topic_filter.len();
    }

    compute_variable_length_integer_encode_size(total_remaining_length)?;

    Ok(total_remaining_length as u32)
}

fn get_unsubscribe_packet_topic_filter(packet: &MqttPacket, index: usize) -> &str {
    if let MqttPacket::Unsubscribe(unsubscribe) = packet {
        return &unsubscribe.topic_filters[index];
    }

    panic!("Internal encoding error: invalid topic filter state");
}

#[rustfmt::skip]
pub(crate) fn write_unsubscribe_encoding_steps(packet: &UnsubscribePacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    let total_remaining_length = compute_unsubscribe_packet_length(packet)?;

    encode_integral_expression!(steps, Uint8, UNSUBSCRIBE_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, total_remaining_length);

    encode_integral_expression!(steps, Uint16, packet.packet_id);

    for (i, topic_filter) in packet.topic_filters.iter().enumerate() {
        encode_indexed_string!(steps, get_unsubscribe_packet_topic_filter, topic_filter, i);
    }

    Ok(())
}

pub(crate) fn decode_unsubscribe_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != UNSUBSCRIBE_FIRST_BYTE {
        error!("UnsubscribePacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for unsubscribe packet"));
    }

    let mut packet = UnsubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    while !mutable_body.is_empty() {
        let mut topic_filter = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut topic_filter)?;

        packet.topic_filters.push(topic_filter);
    }

    if packet.topic_filters.is_empty() {
        error!("UnsubscribePacket Decode - empty topic filter payload");
        return Err(MqttError::new_decoding_failure("unsubscribe packet must contain at least one topic filter"));
    }

    Ok(Box::new(MqttPacket::Unsubscribe(packet)))
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " topic_filters: [")?;
        for (i, topic_filter) in self.topic_filters.iter().enumerate() {
            write!(f, " {}: \"{}\"", i, topic_filter)?;
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
    fn unsubscribe_round_trip_encode_decode_single() {
        let packet = UnsubscribePacket {
            packet_id: 123,
            topic_filters: vec!["hello/world".to_string()],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet)));
    }

    #[test]
    fn unsubscribe_round_trip_encode_decode_multiple() {
        let packet = UnsubscribePacket {
            packet_id: 321,
            topic_filters: vec![
                "a/topic/+".to_string(),
                "hello/world".to_string(),
                "deep/#".to_string(),
            ],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet)));
    }

    #[test]
    fn unsubscribe_decode_failure_bad_fixed_header() {
        let packet = UnsubscribePacket::new("hello/world");

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Unsubscribe(packet), 1);
    }

    #[test]
    fn unsubscribe_decode_failure_truncated_topic_filter() {
        let packet = UnsubscribePacket {
            packet_id: 10,
            topic_filters: vec!["ab".to_string()],
        };

        let truncate_topic_filter = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // stretch the final topic filter's length prefix beyond the packet end
            clone[5] = 60;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsubscribe(packet), truncate_topic_filter);
    }
}
