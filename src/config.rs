/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring an MQTT client.
 */

use crate::client::*;
use crate::mqtt::*;
use crate::mqtt::connect::ConnectPacket;
use crate::mqtt::publish::PublishPacket;
use crate::session::SessionStore;

use std::fmt::{Debug, Formatter};
use std::time::Duration;

pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS: u16 = 60;
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Conventional websocket path brokers expose MQTT on.
pub const DEFAULT_ENDPOINT_PATH: &str = "/mqtt";

/// One candidate broker endpoint.  A client may be configured with several; they are tried in
/// order until a connection attempt produces a successful CONNACK.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: String,
}

impl Endpoint {

    /// Creates an endpoint with the conventional websocket path.
    pub fn new(host: &str, port: u16) -> Self {
        Endpoint {
            host: host.to_string(),
            port,
            path: DEFAULT_ENDPOINT_PATH.to_string(),
        }
    }

    /// Replaces the endpoint's websocket path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Endpoint host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Endpoint port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Endpoint websocket path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn uri(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Configuration options that determine the CONNECT packet sent out by the client on each
/// connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {

    /// The maximum time interval, in seconds, that is permitted to elapse between the point at
    /// which the client finishes transmitting one MQTT packet and the point it starts sending
    /// the next.  The client uses PINGREQ packets to maintain this property.  Zero disables
    /// keep alive processing, which is not advised.
    pub(crate) keep_alive_interval_seconds: u16,

    /// If true, the broker discards any prior session state for this client id on connect and
    /// persists nothing from this connection.  If false, unacknowledged QoS 1+ publish traffic
    /// is durably tracked and replayed across reconnects and restarts.
    pub(crate) clean_session: bool,

    /// A unique string identifying the client to the server.  Used to restore session state
    /// between connections.
    pub(crate) client_id: Option<String>,

    /// A string value that the server may use for client authentication and authorization.
    pub(crate) username: Option<String>,

    /// Opaque binary data that the server may use for client authentication and authorization.
    pub(crate) password: Option<Vec<u8>>,

    /// Message published by the server when this connection ends ungracefully.
    pub(crate) will: Option<PublishPacket>,

    /// Wire protocol revision to speak.
    pub(crate) protocol_version: ProtocolVersion,

    /// Tracks whether the protocol version was chosen by the user or defaulted.  A defaulted
    /// 3.1.1 is allowed to fall back to 3.1 when no candidate endpoint ever produces a CONNACK.
    pub(crate) protocol_version_explicit: bool,
}

impl ConnectOptions {

    pub(crate) fn to_connect_packet(&self) -> ConnectPacket {
        ConnectPacket {
            keep_alive_interval_seconds: self.keep_alive_interval_seconds,
            clean_session: self.clean_session,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            will: self.will.clone(),
        }
    }

    /// Configured keep alive interval, in seconds
    pub fn keep_alive_interval_seconds(&self) -> u16 {
        self.keep_alive_interval_seconds
    }

    /// Configured clean session flag
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Configured client id, if any
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            keep_alive_interval_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            clean_session: true,
            client_id: None,
            username: None,
            password: None,
            will: None,
            protocol_version: ProtocolVersion::Mqtt311,
            protocol_version_explicit: false,
        }
    }
}

/// A builder for connection-related options on the client.
#[derive(Debug, Default)]
pub struct ConnectOptionsBuilder {
    options: ConnectOptions
}

impl ConnectOptionsBuilder {

    /// Creates a new builder object with default options: 60 second keep alive, clean session,
    /// MQTT 3.1.1 with 3.1 fallback enabled.
    pub fn new() -> Self {
        ConnectOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the maximum time interval, in seconds, that is permitted to elapse between client
    /// transmissions.  Zero disables keep alive.
    pub fn with_keep_alive_interval_seconds(mut self, keep_alive: u16) -> Self {
        self.options.keep_alive_interval_seconds = keep_alive;
        self
    }

    /// Sets whether the broker should discard prior session state on connect.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.options.clean_session = clean_session;
        self
    }

    /// Sets the string identifying this client to the server.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.options.client_id = Some(client_id.to_string());
        self
    }

    /// Sets the username the client should transmit on connect.
    pub fn with_username(mut self, username: &str) -> Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets the password the client should transmit on connect.  A password requires a
    /// username; the combination is validated when the client connects.
    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Sets the will message the server should publish if this connection ends ungracefully.
    pub fn with_will(mut self, will: PublishPacket) -> Self {
        self.options.will = Some(will);
        self
    }

    /// Pins the wire protocol revision.  Setting a version explicitly disables the automatic
    /// 3.1.1-to-3.1 fallback that otherwise applies when no endpoint produces a CONNACK.
    pub fn with_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.options.protocol_version = protocol_version;
        self.options.protocol_version_explicit = true;
        self
    }

    /// Builds a new ConnectOptions object from the builder's configuration
    pub fn build(self) -> ConnectOptions {
        self.options
    }
}

/// Controls what kind of jitter, if any, the client applies to the reconnect backoff period.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum ExponentialBackoffJitterType {

    /// The client waits the full current backoff period between candidate endpoint attempts
    None,

    /// The client waits a uniformly random amount of the current backoff period
    #[default]
    Uniform
}

/// Configuration for the delay between candidate endpoint connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectOptions {

    /// Controls how the backoff period is randomized
    pub reconnect_period_jitter: ExponentialBackoffJitterType,

    /// Minimum and initial delay between connection attempts
    pub base_reconnect_period: Duration,

    /// Upper bound on the delay between connection attempts
    pub max_reconnect_period: Duration,

    /// Amount of time a connection must remain good for the backoff to reset to the base value
    pub reconnect_stability_reset_period: Duration,
}

impl ReconnectOptions {
    pub(crate) fn normalize(&mut self) {
        if self.base_reconnect_period > self.max_reconnect_period {
            std::mem::swap(&mut self.base_reconnect_period, &mut self.max_reconnect_period)
        }

        if self.max_reconnect_period < Duration::from_secs(1) {
            self.max_reconnect_period = Duration::from_secs(1);
        }
    }
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            reconnect_period_jitter: ExponentialBackoffJitterType::default(),
            base_reconnect_period: Duration::from_secs(1),
            max_reconnect_period: Duration::from_secs(120),
            reconnect_stability_reset_period: Duration::from_secs(30),
        }
    }
}

/// Configuration options for client behavior that is not part of the CONNECT negotiation.
pub struct MqttClientOptions {

    /// Candidate broker endpoints, tried in order
    pub(crate) endpoints: Vec<Endpoint>,

    /// Time budget for one complete connection attempt (transport + CONNECT/CONNACK handshake)
    pub(crate) connect_timeout: Duration,

    /// Default time budget between an ack-based operation's transmission and its ack
    pub(crate) ack_timeout: Duration,

    /// Backoff configuration applied between candidate endpoint attempts
    pub(crate) reconnect_options: ReconnectOptions,

    /// Durable backing store for in-flight QoS 1+ publish traffic
    pub(crate) session_store: Option<Box<dyn SessionStore>>,

    /// Listener attached to the client at construction time
    pub(crate) default_event_listener: Option<ClientEventListener>,
}

impl Debug for MqttClientOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClientOptions")
            .field("endpoints", &self.endpoints)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("reconnect_options", &self.reconnect_options)
            .finish_non_exhaustive()
    }
}

/// A builder for client-level behavior options.
pub struct MqttClientOptionsBuilder {
    options: MqttClientOptions
}

impl MqttClientOptionsBuilder {

    /// Creates a new builder targeting a primary endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        MqttClientOptionsBuilder {
            options: MqttClientOptions {
                endpoints: vec![endpoint],
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                ack_timeout: DEFAULT_ACK_TIMEOUT,
                reconnect_options: ReconnectOptions::default(),
                session_store: None,
                default_event_listener: None,
            }
        }
    }

    /// Appends a failover endpoint to try when earlier candidates cannot be connected to.
    pub fn with_failover_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.options.endpoints.push(endpoint);
        self
    }

    /// Sets the time budget for one complete connection attempt.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    /// Sets the default time budget between an ack-based operation's transmission and the
    /// receipt of its ack.  Individual operations may override this.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.options.ack_timeout = ack_timeout;
        self
    }

    /// Replaces the reconnect backoff configuration.
    pub fn with_reconnect_options(mut self, reconnect_options: ReconnectOptions) -> Self {
        self.options.reconnect_options = reconnect_options;
        self
    }

    /// Injects a durable session store.  Without one, session state lives only as long as the
    /// client object and `clean_session = false` survives reconnects but not restarts.
    pub fn with_session_store(mut self, session_store: Box<dyn SessionStore>) -> Self {
        self.options.session_store = Some(session_store);
        self
    }

    /// Attaches an event listener at construction time.
    pub fn with_default_event_listener(mut self, listener: ClientEventListener) -> Self {
        self.options.default_event_listener = Some(listener);
        self
    }

    /// Builds a new MqttClientOptions object from the builder's configuration
    pub fn build(mut self) -> MqttClientOptions {
        self.options.reconnect_options.normalize();
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uri_forms() {
        let endpoint = Endpoint::new("broker.example.com", 8080);
        assert_eq!("ws://broker.example.com:8080/mqtt", endpoint.uri());

        let endpoint = Endpoint::new("10.0.0.1", 9001).with_path("/ws");
        assert_eq!("ws://10.0.0.1:9001/ws", endpoint.uri());
    }

    #[test]
    fn connect_options_defaults() {
        let options = ConnectOptionsBuilder::new().build();

        assert_eq!(DEFAULT_KEEP_ALIVE_SECONDS, options.keep_alive_interval_seconds);
        assert!(options.clean_session);
        assert_eq!(ProtocolVersion::Mqtt311, options.protocol_version);
        assert!(!options.protocol_version_explicit);
    }

    #[test]
    fn explicit_protocol_version_disables_fallback() {
        let options = ConnectOptionsBuilder::new()
            .with_protocol_version(ProtocolVersion::Mqtt311)
            .build();

        assert!(options.protocol_version_explicit);
    }

    #[test]
    fn reconnect_options_normalization() {
        let mut options = ReconnectOptions {
            base_reconnect_period: Duration::from_secs(240),
            max_reconnect_period: Duration::from_millis(10),
            ..Default::default()
        };

        options.normalize();

        assert!(options.base_reconnect_period <= options.max_reconnect_period);
        assert!(options.max_reconnect_period >= Duration::from_secs(1));
    }
}
