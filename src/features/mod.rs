/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Runtime integrations.  The only one currently offered pairs tokio with a websocket transport.
 */

pub mod tokio_ws;
