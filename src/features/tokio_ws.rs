/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Functionality for running the MQTT client on [`tokio`](https://crates.io/crates/tokio) over a
websocket transport.

MQTT-over-websockets is message-oriented: every complete websocket binary frame carries one or
more MQTT packet fragments, and the sub-protocol negotiated during the upgrade identifies the
MQTT revision in use (`mqtt` for 3.1.1, `mqttv3.1` for 3.1).
 */

use crate::client::*;
use crate::client::shared_impl::*;
use crate::config::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::ProtocolVersion;
use crate::protocol::is_connection_established;

use futures::{SinkExt, StreamExt};
use log::*;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::runtime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER_SIZE: usize = 4096;

fn websocket_subprotocol(protocol_version: ProtocolVersion) -> &'static str {
    match protocol_version {
        ProtocolVersion::Mqtt31 => { "mqttv3.1" }
        ProtocolVersion::Mqtt311 => { "mqtt" }
    }
}

async fn make_websocket_connection(endpoint: Endpoint, protocol_version: ProtocolVersion) -> MqttResult<WsStream> {
    let uri = endpoint.uri();
    info!("tokio_ws - opening websocket connection to {}", uri);

    let mut request = uri.into_client_request()?;
    request.headers_mut().insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        http::HeaderValue::from_static(websocket_subprotocol(protocol_version)));

    let (stream, _) = connect_async(request).await?;

    Ok(stream)
}

pub(crate) struct ClientRuntimeState {
    operation_receiver: tokio::sync::mpsc::UnboundedReceiver<OperationOptions>,
    websocket: Option<WsStream>,
}

impl ClientRuntimeState {

    pub(crate) async fn process_stopped(&mut self, client: &mut MqttClientImpl) -> MqttResult<ClientImplState> {
        loop {
            trace!("tokio_ws - process_stopped loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    if let Some(operation_options) = operation_result {
                        debug!("tokio_ws - process_stopped - user operation received");
                        client.handle_incoming_operation(operation_options);
                    }
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }

    pub(crate) async fn process_connecting(&mut self, client: &mut MqttClientImpl) -> MqttResult<ClientImplState> {
        let endpoint = client.current_endpoint();
        let mut connect = Box::pin(make_websocket_connection(endpoint, client.ws_protocol_version()));

        let timeout = sleep(*client.connect_timeout());
        tokio::pin!(timeout);

        loop {
            trace!("tokio_ws - process_connecting loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    if let Some(operation_options) = operation_result {
                        debug!("tokio_ws - process_connecting - user operation received");
                        client.handle_incoming_operation(operation_options);
                    }
                }
                () = &mut timeout => {
                    info!("tokio_ws - process_connecting - connection establishment timeout exceeded");
                    client.apply_error(MqttError::new_connection_establishment_failure("connection establishment timeout reached"));
                    return Ok(ClientImplState::PendingReconnect);
                }
                connection_result = &mut connect => {
                    match connection_result {
                        Ok(stream) => {
                            info!("tokio_ws - process_connecting - websocket connection established successfully");
                            self.websocket = Some(stream);
                            return Ok(ClientImplState::Connected);
                        }
                        Err(error) => {
                            info!("tokio_ws - process_connecting - websocket connection establishment failed");
                            client.apply_error(MqttError::new_connection_establishment_failure(error));
                            return Ok(ClientImplState::PendingReconnect);
                        }
                    }
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }

    pub(crate) async fn process_connected(&mut self, client: &mut MqttClientImpl) -> MqttResult<ClientImplState> {
        let mut websocket = self.websocket.take().unwrap();

        let mut next_state = None;
        while next_state.is_none() {
            trace!("tokio_ws - process_connected loop");

            let next_service_time_option = client.get_next_connected_service_time();
            let service_wait = next_service_time_option.map(|next_service_time| sleep(next_service_time.saturating_duration_since(Instant::now())));

            tokio::select! {
                // incoming user operations future
                operation_result = self.operation_receiver.recv() => {
                    if let Some(operation_options) = operation_result {
                        debug!("tokio_ws - process_connected - user operation received");
                        client.handle_incoming_operation(operation_options);
                    }
                }
                // incoming transport frames future
                message_result = websocket.next() => {
                    match message_result {
                        Some(Ok(Message::Binary(payload))) => {
                            debug!("tokio_ws - process_connected - received a {} byte binary frame", payload.len());
                            if let Err(error) = client.handle_incoming_bytes(&payload) {
                                info!("tokio_ws - process_connected - error handling incoming bytes: {:?}", error);
                                next_state = Some(ClientImplState::PendingReconnect);
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            // websocket-level liveness traffic; the library answers pings itself
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("tokio_ws - process_connected - websocket closed by peer");
                            client.apply_error(MqttError::new_connection_closed("websocket closed by peer"));
                            next_state = Some(ClientImplState::PendingReconnect);
                        }
                        Some(Ok(_)) => {
                            warn!("tokio_ws - process_connected - unexpected non-binary frame dropped");
                        }
                        Some(Err(error)) => {
                            info!("tokio_ws - process_connected - websocket read failed: {:?}", error);
                            if is_connection_established(client.get_protocol_state()) {
                                client.apply_error(MqttError::new_connection_closed(error));
                            } else {
                                client.apply_error(MqttError::new_connection_establishment_failure(error));
                            }
                            next_state = Some(ClientImplState::PendingReconnect);
                        }
                    }
                }
                // client service future (if relevant)
                Some(_) = conditional_wait(service_wait) => {
                    debug!("tokio_ws - process_connected - running client service task");
                }
            }

            // every pass services the protocol state and flushes whatever it produced as one
            // binary frame; the frame write doubles as the write completion signal
            if next_state.is_none() {
                let mut outbound_data: Vec<u8> = Vec::with_capacity(OUTBOUND_BUFFER_SIZE);
                if let Err(error) = client.handle_service(&mut outbound_data) {
                    info!("tokio_ws - process_connected - service failure: {:?}", error);
                    next_state = Some(ClientImplState::PendingReconnect);
                } else if !outbound_data.is_empty() {
                    debug!("tokio_ws - process_connected - writing a {} byte binary frame", outbound_data.len());
                    match websocket.send(Message::Binary(outbound_data)).await {
                        Ok(()) => {
                            if let Err(error) = client.handle_write_completion() {
                                info!("tokio_ws - process_connected - write completion handler failed: {:?}", error);
                                next_state = Some(ClientImplState::PendingReconnect);
                            }
                        }
                        Err(error) => {
                            info!("tokio_ws - process_connected - websocket write failed: {:?}", error);
                            if is_connection_established(client.get_protocol_state()) {
                                client.apply_error(MqttError::new_connection_closed(error));
                            } else {
                                client.apply_error(MqttError::new_connection_establishment_failure(error));
                            }
                            next_state = Some(ClientImplState::PendingReconnect);
                        }
                    }
                }
            }

            if next_state.is_none() {
                next_state = client.compute_optional_state_transition();
            }
        }

        info!("tokio_ws - process_connected - shutting down websocket");
        let _ = websocket.close(None).await;
        info!("tokio_ws - process_connected - websocket fully closed");

        Ok(next_state.unwrap())
    }

    pub(crate) async fn process_pending_reconnect(&mut self, client: &mut MqttClientImpl, wait: std::time::Duration) -> MqttResult<ClientImplState> {
        let reconnect_timer = sleep(wait);
        tokio::pin!(reconnect_timer);

        loop {
            trace!("tokio_ws - process_pending_reconnect loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    if let Some(operation_options) = operation_result {
                        debug!("tokio_ws - process_pending_reconnect - user operation received");
                        client.handle_incoming_operation(operation_options);
                    }
                }
                () = &mut reconnect_timer => {
                    info!("tokio_ws - process_pending_reconnect - reconnect timer elapsed");
                    return Ok(ClientImplState::Connecting);
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }
}

async fn conditional_wait(wait_option: Option<tokio::time::Sleep>) -> Option<()> {
    match wait_option {
        Some(timer) => {
            timer.await;
            Some(())
        },
        None => None,
    }
}

async fn client_event_loop(client_impl: &mut MqttClientImpl, async_state: &mut ClientRuntimeState) {
    let mut done = false;
    while !done {
        let current_state = client_impl.get_current_state();
        let next_state_result =
            match current_state {
                ClientImplState::Stopped => { async_state.process_stopped(client_impl).await }
                ClientImplState::Connecting => { async_state.process_connecting(client_impl).await }
                ClientImplState::Connected => { async_state.process_connected(client_impl).await }
                ClientImplState::PendingReconnect => {
                    let reconnect_wait = client_impl.advance_reconnect_period();
                    async_state.process_pending_reconnect(client_impl, reconnect_wait).await
                }
                _ => { Ok(ClientImplState::Shutdown) }
            };

        done = true;
        if let Ok(next_state) = next_state_result {
            if client_impl.transition_to_state(next_state).is_ok() && (next_state != ClientImplState::Shutdown) {
                done = false;
            }
        }
    }

    info!("tokio_ws - client event loop exiting");
}

fn spawn_client_impl(
    mut client_impl: MqttClientImpl,
    mut runtime_state: ClientRuntimeState,
    runtime_handle: &runtime::Handle,
) {
    runtime_handle.spawn(async move {
        client_event_loop(&mut client_impl, &mut runtime_state).await;
    });
}

pub(crate) fn spawn_event_callback(event: Arc<ClientEvent>, callback: Arc<ClientEventListenerCallback>) {
    tokio::spawn(async move {
        (callback)(event)
    });
}

fn create_runtime_states() -> (UnboundedSender<OperationOptions>, ClientRuntimeState) {
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();

    let impl_state = ClientRuntimeState {
        operation_receiver: receiver,
        websocket: None,
    };

    (sender, impl_state)
}

/// Creates a new MQTT 3.x client running on the passed-in tokio runtime, speaking MQTT over
/// websockets to the configured endpoints.
pub fn new_with_tokio(client_config: MqttClientOptions, connect_config: ConnectOptions, runtime_handle: &runtime::Handle) -> MqttResult<MqttClient> {
    let (operation_sender, runtime_state) = create_runtime_states();

    let client_impl = MqttClientImpl::new(client_config, connect_config)?;

    spawn_client_impl(client_impl, runtime_state, runtime_handle);

    Ok(MqttClient {
        user_state: UserRuntimeState {
            operation_sender
        },
        listener_id_allocator: Mutex::new(1),
    })
}
