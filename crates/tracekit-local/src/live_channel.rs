// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One live-update session: bridges an upgraded WebSocket connection to a broadcaster
//! subscription until either side goes away.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};
use tracing::debug;

use crate::broadcaster::{Broadcaster, Frame, Subscription};

/// Forwards queued frames to the socket as text messages. Inbound messages are only read to
/// notice the peer closing. The subscription is removed from the broadcaster however the session
/// ends.
pub async fn run_session<S>(
    stream: WebSocketStream<S>,
    mut subscription: Subscription,
    broadcaster: Arc<Broadcaster>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut outbound, mut inbound) = stream.split();

    loop {
        tokio::select! {
            frame = subscription.frames.recv() => match frame {
                Some(Frame::Text(text)) => {
                    if let Err(err) = outbound.send(WsMessage::text(text.to_string())).await {
                        debug!("Live subscriber {}: send failed: {err}", subscription.id);
                        break;
                    }
                }
                // broadcaster closed, or it already dropped us
                Some(Frame::Close) | None => {
                    let _ = outbound.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            message = inbound.next() => match message {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("Live subscriber {}: read failed: {err}", subscription.id);
                    break;
                }
            },
        }
    }

    broadcaster.unsubscribe(subscription.id).await;
}
