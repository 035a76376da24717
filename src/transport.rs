use std::time::Duration;

use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::header::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport carrying binary frames for the chat protocol.
pub struct WsTransport {
    stream: WsStream,
}

impl WsTransport {
    /// Opens the websocket, optionally sending an Origin header.
    pub async fn connect(
        url: &str,
        origin: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut request = url.into_client_request()?;
        if let Some(origin) = origin {
            let value = HeaderValue::from_str(origin).map_err(http::Error::from)?;
            request.headers_mut().insert("Origin", value);
        }

        let connect = connect_async(request);
        let (stream, _) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::UnexpectedEof)?
            .map_err(TransportError::SocketOpenFailed)?;

        Ok(Self { stream })
    }

    /// Splits into independently usable write and read halves.
    pub fn split(self) -> (WsSink, WsSource) {
        let (sink, stream) = self.stream.split();
        (WsSink { sink }, WsSource { stream })
    }
}

/// Write half of the transport.
pub struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

impl WsSink {
    /// Sends raw bytes as one binary websocket message.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(payload.to_vec().into()))
            .await?;
        Ok(())
    }

    /// Sends a close frame and flushes.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.send(Message::Close(None)).await?;
        Ok(())
    }
}

/// Read half of the transport.
pub struct WsSource {
    stream: SplitStream<WsStream>,
}

impl WsSource {
    /// Returns the next binary payload; control frames are handled inline.
    pub async fn next_chunk(&mut self) -> Result<Bytes, TransportError> {
        loop {
            let message = self
                .stream
                .next()
                .await
                .ok_or(TransportError::UnexpectedEof)??;

            match message {
                Message::Binary(data) => return Ok(Bytes::from(data)),
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1000, String::new()));
                    return Err(TransportError::SocketClosed { code, reason });
                }
                // Pings are answered by the protocol layer underneath the split.
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Text(_) => continue,
                Message::Frame(_) => continue,
            }
        }
    }
}
