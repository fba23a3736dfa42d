use dx_protocol::{CommandFrame, ControlFrame, PushFrame};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A scripted Connector endpoint: opens the push channel for a node
/// identifier, surfaces command frames, and answers keep-alive pings.
pub struct MockConnector {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockConnector {
    /// Opens the push channel at `ws://{addr}/connect?mac={mac}`.
    pub async fn connect(addr: &str, mac: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let url = format!("ws://{addr}/connect?mac={mac}");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Waits for the next command frame, transparently answering
    /// control pings along the way.
    pub async fn recv_command(&mut self) -> Result<CommandFrame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<PushFrame>(&text)? {
                    PushFrame::Command(frame) => return Ok(frame),
                    PushFrame::Control(ControlFrame::Ping) => self.send_pong().await?,
                    PushFrame::Control(ControlFrame::Pong) => {}
                },
                Some(Ok(Message::Ping(payload))) => {
                    self.write.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => return Err("connection closed by router".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Waits until the router closes the channel (eviction or
    /// replacement), answering nothing in the meantime.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Err(_)) => return true,
                Some(Ok(_)) => {}
            }
        }
    }

    pub async fn send_pong(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&ControlFrame::Pong)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
