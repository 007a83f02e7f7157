use crate::gateway::frame::GatewayFrame;

use futures::{SinkExt, TryStreamExt};
use serde_json::Error as JsonError;
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        error::Error as TungsteniteError,
        protocol::{frame::coding::CloseCode as WsCloseCode, CloseFrame, WebSocketConfig},
        Message,
    },
    MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, instrument};
use url::Url;

pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    #[instrument]
    pub(crate) async fn connect(url: Url) -> Result<Self> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = None;
        ws_config.max_frame_size = None;

        let (stream, _) =
            tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), true)
                .await?;

        Ok(Self(stream))
    }

    pub(crate) async fn recv_frame(&mut self) -> Result<Option<GatewayFrame>> {
        convert_ws_message(self.0.try_next().await?)
    }

    pub(crate) async fn send_frame(&mut self, frame: &GatewayFrame) -> Result<()> {
        Ok(serde_json::to_string(frame)
            .map(Message::Text)
            .map_err(Error::from)
            .map(|m| self.0.send(m))?
            .await?)
    }

    pub(crate) async fn close(&mut self, code: u16, reason: &'static str) -> Result<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: Cow::Borrowed(reason),
        };

        Ok(self.0.close(Some(frame)).await?)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Json(JsonError),

    /// The gateway offers no compression on this connection, so only
    /// text messages are expected.
    UnexpectedBinaryMessage(Vec<u8>),

    Ws(TungsteniteError),

    WsClosed(Option<CloseFrame<'static>>),
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Error {
        Error::Ws(e)
    }
}

#[inline]
pub(crate) fn convert_ws_message(message: Option<Message>) -> Result<Option<GatewayFrame>> {
    Ok(match message {
        Some(Message::Text(payload)) => serde_json::from_str(&payload)
            .map_err(|e| {
                debug!("Unexpected JSON: {e}. Payload: {payload}");
                e
            })
            .ok(),
        Some(Message::Binary(bytes)) => {
            return Err(Error::UnexpectedBinaryMessage(bytes));
        },
        Some(Message::Close(frame)) => {
            return Err(Error::WsClosed(frame));
        },
        // The remote endpoint has hung up without a close frame.
        None => {
            return Err(Error::WsClosed(None));
        },
        // Ping/Pong message behaviour is internally handled by tungstenite.
        _ => None,
    })
}
