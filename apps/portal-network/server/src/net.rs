//! TCP transport for keyboard devices.
//!
//! Each connection gets a reader loop and a writer task. Readers only decode
//! and forward; all handling happens on the authoritative loop.

use std::io;

use portal_wire::framing::{recv_device_message, send_server_message};
use portal_wire::{DeviceMessage, FrameError, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sync::OUTBOUND_QUEUE_LEN;

/// Requests queued for the authoritative loop across all connections.
/// Readers wait for room once it fills.
pub const INBOUND_QUEUE_LEN: usize = 1024;

/// Events handed from connection tasks to the authoritative loop.
#[derive(Debug)]
pub enum Inbound {
    Opened {
        session: Uuid,
        outbound: mpsc::Sender<ServerMessage>,
    },
    Message {
        session: Uuid,
        message: DeviceMessage,
    },
    Closed {
        session: Uuid,
    },
}

pub async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<Inbound>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        if inbound.is_closed() {
            break;
        }
        let session = Uuid::new_v4();
        info!(session = %session, %peer, "device connected");
        let inbound = inbound.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, session, inbound).await {
                debug!(session = %session, error = %err, "device connection ended with error");
            }
            info!(session = %session, "device disconnected");
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    session: Uuid,
    inbound: mpsc::Sender<Inbound>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_LEN);

    if inbound
        .send(Inbound::Opened {
            session,
            outbound: outbound_tx.clone(),
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(err) = send_server_message(&mut writer, &message).await {
                debug!(session = %session, error = %err, "write failed");
                break;
            }
        }
    });

    let result = loop {
        match recv_device_message(&mut reader).await {
            Ok(Some(message)) => {
                if inbound
                    .send(Inbound::Message { session, message })
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(FrameError::Wire(err)) => {
                warn!(session = %session, error = %err, "malformed device message");
                let reply = ServerMessage::ConnectionError {
                    message: format!("malformed request: {err}"),
                };
                if outbound_tx.try_send(reply).is_err() {
                    debug!(session = %session, "could not report malformed request");
                }
            }
            Err(FrameError::Io(err)) => break Err(err),
            Err(FrameError::TooLarge(len)) => {
                break Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {len} bytes exceeds limit"),
                ))
            }
        }
    };

    let _ = inbound.send(Inbound::Closed { session }).await;
    drop(outbound_tx);
    // The loop drops its sender on `Closed`; the writer drains and exits.
    let _ = writer_task.await;
    result
}
