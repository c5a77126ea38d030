/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
An asynchronous MQTT 3.1/3.1.1 client for message-oriented transports.

The crate is split into a transport-agnostic protocol core (wire codec, connection state
machine, keep alive, durable session storage) and a thin tokio runtime layer that speaks MQTT
over websockets, negotiating the `mqtt`/`mqttv3.1` sub-protocol during the upgrade.

Create a client with [`features::tokio_ws::new_with_tokio`], then drive it through the
[`client::MqttClient`] handle.  Operations are queue-and-forward: each returns a future that
completes when the matching acknowledgement arrives, the operation's timeout elapses, or the
connection fails.  Connection lifecycle changes and arriving messages are broadcast to
registered event listeners.

With `clean_session` disabled and a [`session::SessionStore`] injected, unacknowledged QoS 1
and QoS 2 publish traffic survives reconnects and client restarts: interrupted deliveries are
replayed (as duplicates, in original submission order) after the next successful CONNACK, with
QoS 2 handshakes resuming exactly where they left off.
 */

pub mod client;
pub mod config;
mod decode;
mod encode;
pub mod error;
pub mod features;
mod keepalive;
mod logging;
pub mod mqtt;
mod protocol;
pub mod session;
mod validate;

pub use error::{MqttError, MqttResult};

/* Re-export the mqtt data model at the root level */
pub use mqtt::{ConnectReturnCode, ProtocolVersion, QualityOfService, SubscribeReturnCode, Subscription};

pub use mqtt::connack::ConnackPacket;
pub use mqtt::connect::ConnectPacket;
pub use mqtt::disconnect::DisconnectPacket;
pub use mqtt::pingreq::PingreqPacket;
pub use mqtt::pingresp::PingrespPacket;
pub use mqtt::puback::PubackPacket;
pub use mqtt::pubcomp::PubcompPacket;
pub use mqtt::publish::PublishPacket;
pub use mqtt::pubrec::PubrecPacket;
pub use mqtt::pubrel::PubrelPacket;
pub use mqtt::suback::SubackPacket;
pub use mqtt::subscribe::SubscribePacket;
pub use mqtt::unsuback::UnsubackPacket;
pub use mqtt::unsubscribe::UnsubscribePacket;

pub use client::*;
