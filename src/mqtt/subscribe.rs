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

/// Data model of an MQTT 3.x SUBSCRIBE packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {

    /// Packet id bound to this subscribe while it is in flight.
    pub packet_id: u16,

    /// List of topic filter subscriptions the client wishes to add.  Must be non-empty.
    pub subscriptions: Vec<Subscription>,
}

impl SubscribePacket {

    /// Creates a new subscribe for a single topic filter
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        SubscribePacket {
            subscriptions: vec![Subscription::new(topic_filter, qos)],
            ..Default::default()
        }
    }
}

fn compute_subscribe_packet_length(packet: &SubscribePacket) -> MqttResult<u32> {
    let mut total_remaining_length: usize = 2;

    for subscription in &packet.subscriptions {
        total_remaining_length += 2 + subscription.topic_filter.len() + 1;
    }

    compute_variable_length_integer_encode_size(total_remaining_length)?;

    Ok(total_remaining_length as u32)
}

fn get_subscribe_packet_topic_filter(packet: &MqttPacket, index: usize) -> &str {
    if let MqttPacket::Subscribe(subscribe) = packet {
        return &subscribe.subscriptions[index].topic_filter;
    }

    panic!("Internal encoding error: invalid subscription state");
}

#[rustfmt::skip]
pub(crate) fn write_subscribe_encoding_steps(packet: &SubscribePacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    let total_remaining_length = compute_subscribe_packet_length(packet)?;

    encode_integral_expression!(steps, Uint8, SUBSCRIBE_FIRST_BYTE);
    encode_integral_expression!(steps, Vli, total_remaining_length);

    encode_integral_expression!(steps, Uint16, packet.packet_id);

    for (i, subscription) in packet.subscriptions.iter().enumerate() {
        encode_indexed_string!(steps, get_subscribe_packet_topic_filter, subscription.topic_filter, i);
        encode_enum!(steps, Uint8, u8, subscription.qos);
    }

    Ok(())
}

pub(crate) fn decode_subscribe_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    if first_byte != SUBSCRIBE_FIRST_BYTE {
        error!("SubscribePacket Decode - invalid first byte");
        return Err(MqttError::new_decoding_failure("invalid first byte for subscribe packet"));
    }

    let mut packet = SubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    while !mutable_body.is_empty() {
        let mut subscription = Subscription { ..Default::default() };
        mutable_body = decode_length_prefixed_string(mutable_body, &mut subscription.topic_filter)?;
        mutable_body = decode_u8_as_enum(mutable_body, &mut subscription.qos, convert_u8_to_quality_of_service)?;

        packet.subscriptions.push(subscription);
    }

    if packet.subscriptions.is_empty() {
        error!("SubscribePacket Decode - empty subscription payload");
        return Err(MqttError::new_decoding_failure("subscribe packet must contain at least one subscription"));
    }

    Ok(Box::new(MqttPacket::Subscribe(packet)))
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " subscriptions: [")?;
        for (i, subscription) in self.subscriptions.iter().enumerate() {
            write!(f, " {}: (\"{}\", {})", i, subscription.topic_filter, quality_of_service_to_str(subscription.qos))?;
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
    fn subscribe_round_trip_encode_decode_single() {
        let packet = SubscribePacket {
            packet_id: 123,
            subscriptions: vec![
                Subscription::new("hello/world", QualityOfService::AtLeastOnce),
            ],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Subscribe(packet)));
    }

    #[test]
    fn subscribe_round_trip_encode_decode_multiple() {
        let packet = SubscribePacket {
            packet_id: 65321,
            subscriptions: vec![
                Subscription::new("a/topic/+", QualityOfService::AtMostOnce),
                Subscription::new("hello/world", QualityOfService::ExactlyOnce),
                Subscription::new("deep/#", QualityOfService::AtLeastOnce),
            ],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Subscribe(packet)));
    }

    #[test]
    fn subscribe_decode_failure_bad_fixed_header() {
        let packet = SubscribePacket::new("hello/world", QualityOfService::AtLeastOnce);

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Subscribe(packet), 1);
    }

    #[test]
    fn subscribe_decode_failure_invalid_subscription_qos() {
        let packet = SubscribePacket {
            packet_id: 10,
            subscriptions: vec![
                Subscription::new("ab", QualityOfService::AtLeastOnce),
            ],
        };

        let corrupt_subscription_qos = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // fixed header (2) + packet id (2) + topic filter (2 + 2) puts the qos at index 8
            clone[8] = 3;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Subscribe(packet), corrupt_subscription_qos);
    }
}
