use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

#[derive(Debug)]
pub enum NetEvent {
    Connecting,
    Connected,
    Text(String),
    Disconnected,
}

#[derive(Debug)]
pub enum NetCommand {
    SendBinary(Bytes),
    Shutdown,
}

/// Opens one websocket connection per call.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> anyhow::Result<WebSocketStream<Self::Io>>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Io = MaybeTlsStream<TcpStream>;

    async fn connect(&self) -> anyhow::Result<WebSocketStream<Self::Io>> {
        let url = Url::parse(&self.url)?;
        log::info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        Ok(ws_stream)
    }
}

enum LinkExit {
    Closed,
    Shutdown,
}

/// Owns the transport. Reconnects after a fixed delay until shut down.
pub struct NetLink<C: Connector> {
    connector: C,
    reconnect_delay: Duration,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
}

impl<C: Connector> NetLink<C> {
    pub fn new(
        connector: C,
        reconnect_delay: Duration,
        tx: mpsc::Sender<NetEvent>,
        rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
    ) -> Self {
        Self {
            connector,
            reconnect_delay,
            tx,
            rx_cmd,
        }
    }

    // 连接断开后固定间隔重连，不做退避也不限次数
    pub async fn run(mut self) {
        loop {
            match self.connect_and_loop().await {
                Ok(LinkExit::Shutdown) => break,
                Ok(LinkExit::Closed) => log::info!("WebSocket closed"),
                Err(e) => log::warn!("Connection error: {}", e),
            }
            if self.tx.send(NetEvent::Disconnected).await.is_err() {
                break;
            }
            log::info!("Reconnecting in {}ms", self.reconnect_delay.as_millis());
            if !self.wait_reconnect().await {
                break;
            }
        }
        log::info!("NetLink stopped");
    }

    /// Sleep out the reconnect delay. Returns false if shut down meanwhile.
    async fn wait_reconnect(&mut self) -> bool {
        let delay = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return true,
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(NetCommand::SendBinary(data)) => {
                        log::debug!("Dropping {} bytes, socket not open", data.len());
                    }
                    Some(NetCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn connect_and_loop(&mut self) -> anyhow::Result<LinkExit> {
        self.tx.send(NetEvent::Connecting).await?;

        let connect = self.connector.connect();
        tokio::pin!(connect);
        let ws_stream = loop {
            tokio::select! {
                res = &mut connect => break res?,
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(NetCommand::SendBinary(data)) => {
                        log::debug!("Dropping {} bytes, socket not open", data.len());
                    }
                    Some(NetCommand::Shutdown) | None => return Ok(LinkExit::Shutdown),
                },
            }
        };
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();
        self.tx.send(NetEvent::Connected).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.tx.send(NetEvent::Text(text.to_string())).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("Ignoring {} byte binary frame from server", data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            return Ok(LinkExit::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(LinkExit::Closed),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendBinary(data)) => {
                            write.send(Message::Binary(data)).await?;
                        }
                        Some(NetCommand::Shutdown) | None => {
                            if let Err(e) = write.send(Message::Close(None)).await {
                                log::debug!("Close frame not sent: {}", e);
                            }
                            return Ok(LinkExit::Shutdown);
                        }
                    }
                }
            }
        }
    }
}
