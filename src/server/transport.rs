//! Session transport
//!
//! A TCP listener bound to an OS-assigned port, plus the framed halves of
//! the one connection it accepts.

use std::net::{IpAddr, SocketAddr};

use futures_util::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::{DapCodec, Outgoing};

/// Inbound frame stream of a session connection
pub type InboundFrames = FramedRead<OwnedReadHalf, DapCodec>;

/// Messages the writer may have queued before senders wait
pub const OUTBOUND_CAPACITY: usize = 256;

/// Queue feeding the transport writer
pub type OutboundSender = mpsc::Sender<Outgoing>;

/// Listener for a single session connection
pub struct SessionListener {
    listener: TcpListener,
}

impl SessionListener {
    /// Bind to an ephemeral port on `addr`
    pub async fn bind(addr: IpAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(addr, 0)).await?;
        Ok(Self { listener })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the front end to connect
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

/// Split a connection into an inbound frame stream and an outbound queue
///
/// The returned task drains the queue into the socket, numbering messages
/// from 1. The queue is bounded: a slow front end holds senders back instead
/// of growing it. The task finishes once every sender is dropped or a write
/// fails; after a failed write, queued messages are discarded.
pub fn split(stream: TcpStream, peer: SocketAddr) -> (InboundFrames, OutboundSender, JoinHandle<()>) {
    let (read_half, write_half) = stream.into_split();
    let inbound = FramedRead::new(read_half, DapCodec::new());
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(write_loop(
        FramedWrite::new(write_half, DapCodec::new()),
        outbound_rx,
        peer,
    ));

    (inbound, outbound_tx, writer)
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, DapCodec>,
    mut outbound_rx: mpsc::Receiver<Outgoing>,
    peer: SocketAddr,
) {
    let mut seq: i64 = 1;

    while let Some(outgoing) = outbound_rx.recv().await {
        let message = outgoing.into_message(seq);
        seq += 1;

        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", peer, e);
                continue;
            }
        };
        debug!("Sending to {}: {}", peer, json);

        if let Err(e) = sink.send(json).await {
            warn!("Transport to {} is no longer writable: {}", peer, e);
            break;
        }
    }

    debug!("Writer for {} finished after {} messages", peer, seq - 1);
}
