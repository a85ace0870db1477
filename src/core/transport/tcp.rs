//! TCP implementation of `LineTransport`, adapted from the teacher's
//! `core::transport::tcp::TcpTransport` (connect/disconnect/send/receive
//! over an `RwLock<Option<TcpStream>>`) to own a split read/write pair so a
//! `recv_line` caller can block on the next line without holding up writers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::traits::{ConnectionState, LineTransport, TransportError};

pub struct TcpLineTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    write_half: RwLock<Option<OwnedWriteHalf>>,
    read_half: Mutex<Option<BufReader<OwnedReadHalf>>>,
    state: RwLock<ConnectionState>,
}

impl TcpLineTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            write_half: RwLock::new(None),
            read_half: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl LineTransport for TcpLineTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        *self.state.write().await = ConnectionState::Connecting;
        let addr = self.addr();
        debug!("connecting to {addr}");

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();
                *self.read_half.lock().await = Some(BufReader::new(read));
                *self.write_half.write().await = Some(write);
                *self.state.write().await = ConnectionState::Connected;
                info!("connected to {addr}");
                Ok(())
            }
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Error;
                Err(TransportError::ConnectionFailed(format!("{addr}: {e}")))
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Error;
                Err(TransportError::Timeout(format!(
                    "connecting to {addr} timed out"
                )))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(mut write) = self.write_half.write().await.take() {
            let _ = write.shutdown().await;
        }
        self.read_half.lock().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
        info!("disconnected from {}", self.addr());
        Ok(())
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.write_half.write().await;
        match guard.as_mut() {
            Some(write) => {
                let mut buf = line.as_bytes().to_vec();
                buf.push(b'\n');
                match write.write_all(&buf).await {
                    Ok(()) => {
                        debug!(direction = "send", "{line}");
                        Ok(())
                    }
                    Err(e) => {
                        *guard = None;
                        *self.state.write().await = ConnectionState::Error;
                        Err(TransportError::SendFailed(e.to_string()))
                    }
                }
            }
            None => Err(TransportError::NotConnected),
        }
    }

    async fn recv_line(&self, recv_timeout: Option<Duration>) -> Result<String, TransportError> {
        let mut guard = self.read_half.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut line = String::new();
        let read = async { reader.read_line(&mut line).await };
        let result = match recv_timeout {
            Some(d) => timeout(d, read)
                .await
                .map_err(|_| TransportError::Timeout("recv_line timed out".into()))?,
            None => read.await,
        };
        match result {
            Ok(0) => {
                *guard = None;
                drop(guard);
                self.write_half.write().await.take();
                *self.state.write().await = ConnectionState::Disconnected;
                warn!("connection closed by peer ({})", self.addr());
                Err(TransportError::ConnectionLost("closed by peer".into()))
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                debug!(direction = "recv", "{trimmed}");
                Ok(trimmed)
            }
            Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_write_and_receive_a_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"status\n");
            sock.write_all(b"ok\n").await.unwrap();
        });

        let transport = TcpLineTransport::new(addr.ip().to_string(), addr.port());
        transport.connect().await.unwrap();
        transport.write_line("status").await.unwrap();
        let reply = transport
            .recv_line(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply, "ok");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn write_line_without_connecting_fails() {
        let transport = TcpLineTransport::new("127.0.0.1", 0);
        let err = transport.write_line("status").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
