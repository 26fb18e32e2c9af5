//! Device side of the portal network protocol.
//!
//! A [`KeyboardClient`] stands in for one keyboard block: it announces its
//! dimension, then issues list/connect/disconnect/rename requests on behalf
//! of the keyboard position it was created with.
//!
//! Frames are read on a task of their own and handed over through a queue,
//! so a timed-out wait never leaves half a frame behind.

use std::net::SocketAddr;
use std::time::Duration;

use portal_network_core::{BlockPos, EndpointId, ResourceId};
use portal_wire::framing::{recv_server_message, send_device_message};
use portal_wire::{DeviceMessage, EndpointEntry, FrameError, ServerMessage};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("server closed the connection")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("server reported: {0}")]
    Server(String),
}

/// Decoded messages waiting for [`KeyboardClient::next_message`].
const INCOMING_QUEUE_LEN: usize = 64;

type Incoming = Result<ServerMessage, FrameError>;

pub struct KeyboardClient {
    incoming: mpsc::Receiver<Incoming>,
    reader_task: JoinHandle<()>,
    writer: OwnedWriteHalf,
    device: BlockPos,
}

impl Drop for KeyboardClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Forwards every frame until the stream ends or can no longer be framed.
/// A payload that fails to decode is reported and reading carries on.
async fn read_messages(mut reader: OwnedReadHalf, incoming: mpsc::Sender<Incoming>) {
    loop {
        let next = match recv_server_message(&mut reader).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => break,
            Err(err) => Err(err),
        };
        let fatal = matches!(next, Err(FrameError::Io(_) | FrameError::TooLarge(_)));
        if incoming.send(next).await.is_err() || fatal {
            break;
        }
    }
    trace!("server stream finished");
}

impl KeyboardClient {
    /// Opens a session and sends `Hello` with the keyboard's dimension.
    pub async fn connect(
        addr: SocketAddr,
        dimension: ResourceId,
        device: BlockPos,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ClientError::Connect { addr, source })?;
        let (reader, writer) = stream.into_split();
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_QUEUE_LEN);
        let reader_task = tokio::spawn(read_messages(reader, incoming_tx));
        let mut client = Self {
            incoming,
            reader_task,
            writer,
            device,
        };
        debug!(%addr, dimension = %dimension, device = %device, "keyboard session opened");
        client.send(DeviceMessage::Hello { dimension }).await?;
        Ok(client)
    }

    pub async fn send(&mut self, message: DeviceMessage) -> Result<(), ClientError> {
        trace!(kind = message.kind_name(), "sending request");
        send_device_message(&mut self.writer, &message).await?;
        Ok(())
    }

    pub async fn request_list(&mut self) -> Result<(), ClientError> {
        let device_pos = self.device;
        self.send(DeviceMessage::EndpointListRequest { device_pos }).await
    }

    pub async fn request_connect(&mut self, target_id: EndpointId) -> Result<(), ClientError> {
        let device_pos = self.device;
        self.send(DeviceMessage::ConnectRequest {
            device_pos,
            target_id,
        })
        .await
    }

    pub async fn request_disconnect(&mut self) -> Result<(), ClientError> {
        let device_pos = self.device;
        self.send(DeviceMessage::DisconnectRequest { device_pos }).await
    }

    pub async fn request_rename(
        &mut self,
        anchor_pos: BlockPos,
        name: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send(DeviceMessage::RenameRequest {
            anchor_pos,
            name: name.into(),
        })
        .await
    }

    /// Waits up to `wait` for the next server message.
    pub async fn next_message(&mut self, wait: Duration) -> Result<ServerMessage, ClientError> {
        match timeout(wait, self.incoming.recv()).await {
            Ok(Some(Ok(message))) => Ok(message),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout(wait)),
        }
    }

    /// Reads until a message matches `pick`, skipping others. A
    /// `ConnectionError` ends the wait early.
    pub async fn wait_for<T>(
        &mut self,
        wait: Duration,
        mut pick: impl FnMut(ServerMessage) -> Option<T>,
    ) -> Result<T, ClientError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(wait));
            }
            match self.next_message(remaining).await? {
                ServerMessage::ConnectionError { message } => {
                    return Err(ClientError::Server(message))
                }
                message => {
                    if let Some(found) = pick(message) {
                        return Ok(found);
                    }
                }
            }
        }
    }

    /// Requests the endpoint list and returns its entries.
    pub async fn list(&mut self, wait: Duration) -> Result<Vec<EndpointEntry>, ClientError> {
        self.request_list().await?;
        self.wait_for(wait, |message| match message {
            ServerMessage::EndpointListResponse { entries, .. } => Some(entries),
            _ => None,
        })
        .await
    }
}

/// Picks an entry by full id, short id prefix, or case-insensitive name.
pub fn find_entry<'a>(entries: &'a [EndpointEntry], query: &str) -> Option<&'a EndpointEntry> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    if let Ok(id) = query.parse::<EndpointId>() {
        return entries.iter().find(|entry| entry.id == id);
    }
    if let Some(named) = entries
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case(query))
    {
        return Some(named);
    }
    let prefix = query.to_ascii_lowercase();
    let mut prefixed = entries
        .iter()
        .filter(|entry| entry.id.to_string().starts_with(&prefix));
    match (prefixed.next(), prefixed.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// One line per entry, as printed by the CLI.
pub fn describe_entry(entry: &EndpointEntry) -> String {
    format!(
        "{}  {:<24} {} {} cost={}",
        entry.id.short(),
        entry.display_name(),
        entry.dimension,
        entry.position,
        entry.cost
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_wire::framing::{recv_device_message, send_server_message};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn entry(name: &str) -> EndpointEntry {
        EndpointEntry {
            id: EndpointId::generate(),
            name: name.to_owned(),
            dimension: ResourceId::overworld(),
            position: BlockPos::new(0, 64, 0),
            cost: 10,
        }
    }

    #[test_timeout::timeout]
    fn finds_entries_by_id_name_or_prefix() {
        let entries = vec![entry("Home"), entry("")];
        assert_eq!(find_entry(&entries, "home").map(|e| e.id), Some(entries[0].id));
        let full = entries[1].id.to_string();
        assert_eq!(find_entry(&entries, &full).map(|e| e.id), Some(entries[1].id));
        let short = entries[1].id.short();
        assert_eq!(find_entry(&entries, &short).map(|e| e.id), Some(entries[1].id));
        assert!(find_entry(&entries, "nowhere").is_none());
        assert!(find_entry(&entries, "  ").is_none());
    }

    #[test_timeout::timeout]
    fn unnamed_entries_describe_with_short_id() {
        let unnamed = entry("");
        assert!(describe_entry(&unnamed).contains(&unnamed.id.short()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_announces_dimension_and_surfaces_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut reader, mut writer) = stream.into_split();
            let hello = recv_device_message(&mut reader).await.expect("recv");
            let list = recv_device_message(&mut reader).await.expect("recv");
            send_server_message(
                &mut writer,
                &ServerMessage::ConnectionError {
                    message: "nope".into(),
                },
            )
            .await
            .expect("send");
            (hello, list)
        });

        let mut client = KeyboardClient::connect(addr, ResourceId::nether(), BlockPos::new(1, 2, 3))
            .await
            .expect("connect");
        let err = client.list(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(ref message) if message == "nope"));

        let (hello, list) = server.await.expect("server task");
        assert_eq!(
            hello,
            Some(DeviceMessage::Hello {
                dimension: ResourceId::nether()
            })
        );
        assert_eq!(
            list,
            Some(DeviceMessage::EndpointListRequest {
                device_pos: BlockPos::new(1, 2, 3)
            })
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn frame_split_across_a_timeout_is_still_read_whole() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut bytes = Vec::new();
            for message in ["first", "second"] {
                send_server_message(
                    &mut bytes,
                    &ServerMessage::ConnectionError {
                        message: message.into(),
                    },
                )
                .await
                .expect("encode");
            }
            stream.write_all(&bytes[..6]).await.expect("partial frame");
            tokio::time::sleep(Duration::from_millis(300)).await;
            stream.write_all(&bytes[6..]).await.expect("rest");
            stream
        });

        let mut client = KeyboardClient::connect(addr, ResourceId::overworld(), BlockPos::new(0, 64, 0))
            .await
            .expect("connect");
        let err = client
            .next_message(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)), "{err:?}");

        for expected in ["first", "second"] {
            let message = client
                .next_message(Duration::from_secs(2))
                .await
                .expect("whole frame");
            assert_eq!(
                message,
                ServerMessage::ConnectionError {
                    message: expected.into()
                }
            );
        }
        drop(server.await.expect("server task"));
    }
}
