use futures_util::{SinkExt, StreamExt};
use shotcast_protocol::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::signaling::BroadcasterIdentity;
use crate::config::SignalingConfig;
use crate::error::{Error, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hub URL with the broadcaster alias in the `uca` query parameter
pub fn endpoint(url: &str, alias: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}uca={}", url, separator, urlencoding::encode(alias))
}

/// Connect and authenticate; returns the stream and the relay-assigned socket id
pub async fn open(
    config: &SignalingConfig,
    identity: &BroadcasterIdentity,
    client_id: &str,
) -> Result<(WsStream, String)> {
    let url = endpoint(&config.url, &identity.alias);
    let timeout = config.request_timeout();
    tracing::debug!("Connecting to {}", url);

    let (mut ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| Error::SignalingTimeout {
            method: "connect".to_string(),
            timeout,
        })??;

    let auth = ClientMessage::Authenticate {
        alias: identity.alias.clone(),
        shot_token: identity.shot_token.clone(),
        client_id: client_id.to_string(),
    };
    let json = serde_json::to_string(&auth)?;
    ws.send(Message::Text(json.into())).await?;

    let socket_id = tokio::time::timeout(timeout, read_auth_reply(&mut ws))
        .await
        .map_err(|_| Error::SignalingTimeout {
            method: "authenticate".to_string(),
            timeout,
        })??;

    tracing::info!("WebSocket authenticated with socket ID: {}", socket_id);
    Ok((ws, socket_id))
}

async fn read_auth_reply(ws: &mut WsStream) -> Result<String> {
    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => {
                return match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Authenticated { socket_id } => Ok(socket_id),
                    ServerMessage::Error { message } => Err(Error::AuthenticationFailed(message)),
                    other => Err(Error::AuthenticationFailed(format!(
                        "unexpected reply during authentication: {:?}",
                        other
                    ))),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Error::AuthenticationFailed(
        "connection closed during authentication".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_goes_into_query() {
        assert_eq!(
            endpoint("ws://hub.local/shot", "Seat A12"),
            "ws://hub.local/shot?uca=Seat%20A12"
        );
        assert_eq!(
            endpoint("wss://hub.local/shot?v=2", "a&b"),
            "wss://hub.local/shot?v=2&uca=a%26b"
        );
    }
}
