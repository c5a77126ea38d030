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

const PUBLISH_HEADER_DUPLICATE_FLAG: u8 = 0x08;
const PUBLISH_HEADER_RETAIN_FLAG: u8 = 0x01;
const PUBLISH_HEADER_QOS_SHIFT: u8 = 1;
const PUBLISH_HEADER_QOS_MASK: u8 = 0x03;

/// Data model of an MQTT 3.x PUBLISH packet: one application message in transit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {

    /// Packet id bound to this message while it is in flight.  Zero (unbound) for QoS 0.
    pub packet_id: u16,

    /// Name of the topic this message is addressed to.
    pub topic: String,

    /// Delivery quality of service for this message.
    pub qos: QualityOfService,

    /// True if this packet might be a redelivery of an earlier attempt.
    pub duplicate: bool,

    /// True if the server should retain this message on the topic.
    pub retain: bool,

    /// Raw payload bytes.  The payload is owned here exclusively; string and byte views are
    /// computed on demand.
    pub payload: Vec<u8>,
}

impl PublishPacket {

    /// Creates a new packet targeted at a topic with the given payload
    pub fn new(topic: &str, qos: QualityOfService, payload: &[u8]) -> Self {
        PublishPacket {
            topic: topic.to_string(),
            qos,
            payload: payload.to_vec(),
            ..Default::default()
        }
    }

    /// View of the payload as a utf-8 string.  Fails if the payload bytes are not valid utf-8.
    pub fn payload_as_utf8(&self) -> MqttResult<&str> {
        Ok(std::str::from_utf8(&self.payload)?)
    }
}

fn compute_publish_packet_length(packet: &PublishPacket) -> MqttResult<u32> {
    let mut total_remaining_length = 2 + packet.topic.len();

    if packet.qos != QualityOfService::AtMostOnce {
        total_remaining_length += 2;
    }

    total_remaining_length += packet.payload.len();

    // make sure the result fits in the remaining length encoding before committing to it
    compute_variable_length_integer_encode_size(total_remaining_length)?;

    Ok(total_remaining_length as u32)
}

fn compute_publish_packet_first_byte(packet: &PublishPacket) -> u8 {
    let mut first_byte = PACKET_TYPE_PUBLISH << 4;

    if packet.duplicate {
        first_byte |= PUBLISH_HEADER_DUPLICATE_FLAG;
    }

    first_byte |= (packet.qos as u8) << PUBLISH_HEADER_QOS_SHIFT;

    if packet.retain {
        first_byte |= PUBLISH_HEADER_RETAIN_FLAG;
    }

    first_byte
}

fn get_publish_packet_topic(packet: &MqttPacket) -> &str {
    get_packet_field!(packet, MqttPacket::Publish, topic)
}

fn get_publish_packet_payload(packet: &MqttPacket) -> &[u8] {
    get_packet_field!(packet, MqttPacket::Publish, payload)
}

#[rustfmt::skip]
pub(crate) fn write_publish_encoding_steps(packet: &PublishPacket, _: &EncodingContext, steps: &mut VecDeque<EncodingStep>) -> MqttResult<()> {
    let total_remaining_length = compute_publish_packet_length(packet)?;

    encode_integral_expression!(steps, Uint8, compute_publish_packet_first_byte(packet));
    encode_integral_expression!(steps, Vli, total_remaining_length);

    encode_length_prefixed_string!(steps, get_publish_packet_topic, packet.topic);

    if packet.qos != QualityOfService::AtMostOnce {
        encode_integral_expression!(steps, Uint16, packet.packet_id);
    }

    /* payload bytes have no length prefix; they run to the end of the packet */
    encode_raw_bytes!(steps, get_publish_packet_payload);

    Ok(())
}

pub(crate) fn decode_publish_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<Box<MqttPacket>> {
    let mut packet = PublishPacket { ..Default::default() };

    packet.duplicate = (first_byte & PUBLISH_HEADER_DUPLICATE_FLAG) != 0;
    packet.retain = (first_byte & PUBLISH_HEADER_RETAIN_FLAG) != 0;
    packet.qos = convert_u8_to_quality_of_service((first_byte >> PUBLISH_HEADER_QOS_SHIFT) & PUBLISH_HEADER_QOS_MASK)?;

    if packet.qos == QualityOfService::AtMostOnce && packet.duplicate {
        error!("PublishPacket Decode - packet id flagged duplicate with QoS 0");
        return Err(MqttError::new_decoding_failure("duplicate flag set on a qos 0 publish"));
    }

    let mut mutable_body = packet_body;
    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.topic)?;

    if packet.qos != QualityOfService::AtMostOnce {
        mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
    }

    packet.payload = mutable_body.to_vec();

    Ok(Box::new(MqttPacket::Publish(packet)))
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_string!(self.topic, f, "topic");
        log_enum!(self.qos, f, "qos", quality_of_service_to_str);
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_primitive_value!(self.retain, f, "retain");
        log_binary_data!(self.payload, f, "payload");
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn publish_round_trip_encode_decode_default() {
        let packet = PublishPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_encode_decode_basic() {
        let packet = PublishPacket {
            topic: "hello/world".to_string(),
            payload: "greetings!".as_bytes().to_vec(),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_encode_decode_qos1() {
        let packet = PublishPacket {
            packet_id: 47,
            topic: "hello/world".to_string(),
            qos: QualityOfService::AtLeastOnce,
            retain: true,
            payload: vec![1, 2, 3, 4, 5],
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_encode_decode_qos2_duplicate() {
        let packet = PublishPacket {
            packet_id: 65535,
            topic: "a/deeply/nested/hierarchy/of/topics".to_string(),
            qos: QualityOfService::ExactlyOnce,
            duplicate: true,
            payload: vec![0u8; 4099],
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_encode_decode_empty_payload() {
        let packet = PublishPacket {
            packet_id: 13,
            topic: "retained/clear".to_string(),
            qos: QualityOfService::AtLeastOnce,
            retain: true,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_decode_failure_invalid_qos() {
        let packet = PublishPacket {
            packet_id: 5,
            topic: "test".to_string(),
            qos: QualityOfService::AtLeastOnce,
            ..Default::default()
        };

        let corrupt_qos = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // set both qos bits in the fixed header
            clone[0] |= (PUBLISH_HEADER_QOS_MASK) << PUBLISH_HEADER_QOS_SHIFT;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Publish(packet), corrupt_qos);
    }

    #[test]
    fn publish_decode_failure_duplicate_with_qos0() {
        let packet = PublishPacket {
            topic: "test".to_string(),
            ..Default::default()
        };

        let set_duplicate = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[0] |= PUBLISH_HEADER_DUPLICATE_FLAG;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Publish(packet), set_duplicate);
    }

    #[test]
    fn publish_decode_failure_inbound_packet_size() {
        let packet = PublishPacket {
            topic: "test/topic".to_string(),
            payload: vec![7u8; 512],
            ..Default::default()
        };

        do_inbound_size_decode_failure_test(&MqttPacket::Publish(packet));
    }

    #[test]
    fn publish_payload_utf8_views() {
        let packet = PublishPacket::new("a/b", QualityOfService::AtMostOnce, "grüße".as_bytes());
        assert_eq!("grüße", packet.payload_as_utf8().unwrap());

        let packet = PublishPacket::new("a/b", QualityOfService::AtMostOnce, &[0xC0u8, 0x20u8]);
        assert!(packet.payload_as_utf8().is_err());
    }
}
