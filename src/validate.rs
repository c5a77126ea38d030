/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing shared validation logic for MQTT 3.x packets.  Outbound validation runs
against user-submitted packets before any protocol action is taken; inbound validation runs
against decoded broker packets before they are handled.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::mqtt::connect::*;
use crate::mqtt::publish::*;
use crate::mqtt::subscribe::*;
use crate::mqtt::unsubscribe::*;
use crate::mqtt::utils::*;

use log::*;

pub(crate) const MAXIMUM_STRING_LENGTH: usize = 65535;
pub(crate) const MAXIMUM_BINARY_LENGTH: usize = 65535;

fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAXIMUM_STRING_LENGTH && !topic.contains(['#', '+'])
}

fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAXIMUM_STRING_LENGTH {
        return false;
    }

    // a multi-level wildcard may only appear as the final level
    if let Some(position) = filter.find('#') {
        if position != filter.len() - 1 {
            return false;
        }

        if position > 0 && !filter[..position].ends_with('/') {
            return false;
        }
    }

    // single-level wildcards must occupy an entire level
    for level in filter.split('/') {
        if level.contains('+') && level != "+" {
            return false;
        }
    }

    true
}

fn validate_connect_packet_outbound(packet: &ConnectPacket) -> MqttResult<()> {
    if let Some(client_id) = &packet.client_id {
        if client_id.len() > MAXIMUM_STRING_LENGTH {
            error!("ConnectPacket Validation - client id too long");
            return Err(MqttError::new_packet_validation(PacketType::Connect, "client id too long"));
        }
    }

    if packet.password.is_some() && packet.username.is_none() {
        error!("ConnectPacket Validation - password present without username");
        return Err(MqttError::new_packet_validation(PacketType::Connect, "password present without username"));
    }

    if let Some(password) = &packet.password {
        if password.len() > MAXIMUM_BINARY_LENGTH {
            error!("ConnectPacket Validation - password too long");
            return Err(MqttError::new_packet_validation(PacketType::Connect, "password too long"));
        }
    }

    if let Some(will) = &packet.will {
        if !is_valid_topic_name(&will.topic) {
            error!("ConnectPacket Validation - invalid will topic");
            return Err(MqttError::new_packet_validation(PacketType::Connect, "invalid will topic"));
        }
    }

    Ok(())
}

fn validate_publish_packet_outbound(packet: &PublishPacket) -> MqttResult<()> {
    if !is_valid_topic_name(&packet.topic) {
        error!("PublishPacket Validation - invalid topic name");
        return Err(MqttError::new_packet_validation(PacketType::Publish, "invalid topic name"));
    }

    Ok(())
}

fn validate_subscribe_packet_outbound(packet: &SubscribePacket) -> MqttResult<()> {
    if packet.subscriptions.is_empty() {
        error!("SubscribePacket Validation - empty subscription list");
        return Err(MqttError::new_packet_validation(PacketType::Subscribe, "empty subscription list"));
    }

    for subscription in &packet.subscriptions {
        if !is_valid_topic_filter(&subscription.topic_filter) {
            error!("SubscribePacket Validation - invalid topic filter \"{}\"", subscription.topic_filter);
            return Err(MqttError::new_packet_validation(PacketType::Subscribe, "invalid topic filter"));
        }
    }

    Ok(())
}

fn validate_unsubscribe_packet_outbound(packet: &UnsubscribePacket) -> MqttResult<()> {
    if packet.topic_filters.is_empty() {
        error!("UnsubscribePacket Validation - empty topic filter list");
        return Err(MqttError::new_packet_validation(PacketType::Unsubscribe, "empty topic filter list"));
    }

    for topic_filter in &packet.topic_filters {
        if !is_valid_topic_filter(topic_filter) {
            error!("UnsubscribePacket Validation - invalid topic filter \"{}\"", topic_filter);
            return Err(MqttError::new_packet_validation(PacketType::Unsubscribe, "invalid topic filter"));
        }
    }

    Ok(())
}

/// Validates a user-submitted packet before any protocol action is taken on it.  Failures here
/// surface synchronously from the public API.
pub(crate) fn validate_packet_outbound(packet: &MqttPacket) -> MqttResult<()> {
    match packet {
        MqttPacket::Connect(connect) => { validate_connect_packet_outbound(connect) }
        MqttPacket::Publish(publish) => { validate_publish_packet_outbound(publish) }
        MqttPacket::Subscribe(subscribe) => { validate_subscribe_packet_outbound(subscribe) }
        MqttPacket::Unsubscribe(unsubscribe) => { validate_unsubscribe_packet_outbound(unsubscribe) }
        MqttPacket::Puback(_) | MqttPacket::Pubrec(_) | MqttPacket::Pubrel(_) | MqttPacket::Pubcomp(_)
            | MqttPacket::Disconnect(_) | MqttPacket::Pingreq(_) => { Ok(()) }
        _ => {
            // CONNACK, SUBACK, UNSUBACK and PINGRESP only ever flow broker-to-client
            error!("Outbound Packet Validation - invalid packet type for client emission");
            Err(MqttError::new_packet_validation(mqtt_packet_to_packet_type(packet), "invalid packet type for client emission"))
        }
    }
}

fn validate_ack_packet_id_inbound(packet_id: u16, packet_type: PacketType) -> MqttResult<()> {
    if packet_id == 0 {
        error!("{} Validation - packet id may not be zero", packet_type);
        return Err(MqttError::new_packet_validation(packet_type, "packet id may not be zero"));
    }

    Ok(())
}

/// Validates a decoded broker packet before the protocol state handles it.
pub(crate) fn validate_packet_inbound(packet: &MqttPacket) -> MqttResult<()> {
    match packet {
        MqttPacket::Publish(publish) => {
            if publish.qos != QualityOfService::AtMostOnce {
                validate_ack_packet_id_inbound(publish.packet_id, PacketType::Publish)?;
            }

            Ok(())
        }
        MqttPacket::Puback(puback) => { validate_ack_packet_id_inbound(puback.packet_id, PacketType::Puback) }
        MqttPacket::Pubrec(pubrec) => { validate_ack_packet_id_inbound(pubrec.packet_id, PacketType::Pubrec) }
        MqttPacket::Pubrel(pubrel) => { validate_ack_packet_id_inbound(pubrel.packet_id, PacketType::Pubrel) }
        MqttPacket::Pubcomp(pubcomp) => { validate_ack_packet_id_inbound(pubcomp.packet_id, PacketType::Pubcomp) }
        MqttPacket::Suback(suback) => { validate_ack_packet_id_inbound(suback.packet_id, PacketType::Suback) }
        MqttPacket::Unsuback(unsuback) => { validate_ack_packet_id_inbound(unsuback.packet_id, PacketType::Unsuback) }
        _ => { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_validation() {
        assert!(is_valid_topic_name("a/b/c"));
        assert!(is_valid_topic_name("a"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("a/+/c"));
        assert!(!is_valid_topic_name("a/b/#"));
    }

    #[test]
    fn topic_filter_validation() {
        assert!(is_valid_topic_filter("a/b/c"));
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("a/#"));
        assert!(is_valid_topic_filter("+/b/+"));
        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("a/#/c"));
        assert!(!is_valid_topic_filter("a#"));
        assert!(!is_valid_topic_filter("a/b+/c"));
    }

    #[test]
    fn connect_validate_failure_password_without_username() {
        let packet = ConnectPacket {
            password: Some(vec![1, 2, 3]),
            ..Default::default()
        };

        assert!(validate_packet_outbound(&MqttPacket::Connect(packet)).is_err());
    }

    #[test]
    fn publish_validate_failure_wildcard_topic() {
        let packet = PublishPacket::new("a/+/c", QualityOfService::AtMostOnce, &[]);

        assert!(validate_packet_outbound(&MqttPacket::Publish(packet)).is_err());
    }

    #[test]
    fn subscribe_validate_failure_empty() {
        let packet = SubscribePacket {
            ..Default::default()
        };

        assert!(validate_packet_outbound(&MqttPacket::Subscribe(packet)).is_err());
    }

    #[test]
    fn inbound_validate_failure_zero_packet_id() {
        let packet = MqttPacket::Puback(crate::mqtt::puback::PubackPacket { packet_id: 0 });

        assert!(validate_packet_inbound(&packet).is_err());
    }
}
