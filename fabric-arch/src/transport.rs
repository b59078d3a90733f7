//! Per-peer duplex byte stream transport (TCP).
//!
//! One [`PeerConn`] wraps one `TcpStream` and exposes it as a
//! `Broker<TransportIn, TransportOut>` so the rest of the stack talks to
//! peers the same way it talks to every other subsystem. Reads and writes
//! never block the caller: outbound bytes are queued and drained by a
//! dedicated writer task, inbound frames are pushed out as they complete.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::broker::{Broker, Subsystem, SubsystemHandler};
use crate::platform_async_trait;

/// Above this many queued outbound bytes, the peer is considered slow.
pub const HIGH_WATER_MARK: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportIn {
    /// Buffer one length-prefixed frame for transmission.
    Send(Bytes),
    /// Request a flush attempt right away.
    Flush,
    /// Ask for a notification once every byte enqueued so far has been
    /// observed as written. Callers supply their own correlation token.
    NotifyWhenDelivered(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportOut {
    /// One complete inbound frame.
    Received(Bytes),
    /// Backpressure state changed (true = above the high-water-mark).
    Slow(bool),
    /// All bytes enqueued before the matching `NotifyWhenDelivered` call
    /// have been written to the OS.
    AllDelivered(u64),
    /// The peer is dead (I/O error or clean EOF). Raised exactly once.
    PeerShutdown,
}

struct PendingNotify {
    /// Total bytes enqueued at the moment the notification was requested.
    threshold: u64,
    token: u64,
}

/// Drives the write half: drains the outbound queue, tracks how many bytes
/// have actually left the process, and resolves delivery notifications in
/// registration order.
struct Writer {
    write_half: OwnedWriteHalf,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    written_bytes: u64,
    enqueued_bytes: u64,
    pending: VecDeque<PendingNotify>,
    was_slow: bool,
}

impl Writer {
    fn enqueue(&mut self, frame: Bytes) {
        let mut framed = Vec::with_capacity(4 + frame.len());
        framed.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        framed.extend_from_slice(&frame);
        self.queued_bytes += framed.len();
        self.enqueued_bytes += framed.len() as u64;
        self.queue.push_back(Bytes::from(framed));
    }

    fn is_slow(&self) -> bool {
        self.queued_bytes >= HIGH_WATER_MARK
    }

    async fn drain(&mut self) -> Result<Vec<TransportOut>, std::io::Error> {
        let mut out = vec![];
        while let Some(frame) = self.queue.pop_front() {
            self.write_half.write_all(&frame).await?;
            self.queued_bytes -= frame.len();
            self.written_bytes += frame.len() as u64;
        }
        self.write_half.flush().await?;

        while let Some(p) = self.pending.front() {
            if self.written_bytes >= p.threshold {
                out.push(TransportOut::AllDelivered(p.token));
                self.pending.pop_front();
            } else {
                break;
            }
        }

        let slow_now = self.is_slow();
        if slow_now != self.was_slow {
            self.was_slow = slow_now;
            out.push(TransportOut::Slow(slow_now));
        }
        Ok(out)
    }
}

pub struct PeerConn {
    send: UnboundedSender<WriterCmd>,
}

enum WriterCmd {
    Send(Bytes),
    Flush,
    Notify(u64),
}

impl PeerConn {
    /// Dials `addr` and wraps the resulting stream.
    pub async fn connect(addr: &str) -> Result<Broker<TransportIn, TransportOut>, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Self::from_stream(stream).await
    }

    /// Wraps an already-accepted stream (the registry / peer listener side).
    pub async fn from_stream(
        stream: TcpStream,
    ) -> Result<Broker<TransportIn, TransportOut>, TransportError> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let mut broker = Broker::new();
        let (tx, rx) = unbounded_channel();

        let reader_broker = broker.clone();
        tokio::spawn(Self::reader_loop(read_half, reader_broker));

        let writer_broker = broker.clone();
        tokio::spawn(Self::writer_loop(write_half, rx, writer_broker));

        broker
            .add_subsystem(Subsystem::Handler(Box::new(PeerConn { send: tx })))
            .await?;
        Ok(broker)
    }

    async fn reader_loop(mut read_half: OwnedReadHalf, mut broker: Broker<TransportIn, TransportOut>) {
        loop {
            let mut len_buf = [0u8; 4];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                let _ = broker.emit_msg_out(TransportOut::PeerShutdown);
                return;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            if read_half.read_exact(&mut body).await.is_err() {
                let _ = broker.emit_msg_out(TransportOut::PeerShutdown);
                return;
            }
            if broker
                .emit_msg_out(TransportOut::Received(Bytes::from(body)))
                .is_err()
            {
                return;
            }
        }
    }

    async fn writer_loop(
        write_half: OwnedWriteHalf,
        mut rx: UnboundedReceiver<WriterCmd>,
        mut broker: Broker<TransportIn, TransportOut>,
    ) {
        let mut writer = Writer {
            write_half,
            queue: VecDeque::new(),
            queued_bytes: 0,
            written_bytes: 0,
            enqueued_bytes: 0,
            pending: VecDeque::new(),
            was_slow: false,
        };
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCmd::Send(frame) => writer.enqueue(frame),
                WriterCmd::Flush => {}
                WriterCmd::Notify(token) => writer.pending.push_back(PendingNotify {
                    threshold: writer.enqueued_bytes,
                    token,
                }),
            }
            match writer.drain().await {
                Ok(events) => {
                    for e in events {
                        if broker.emit_msg_out(e).is_err() {
                            return;
                        }
                    }
                }
                Err(_) => {
                    let _ = broker.emit_msg_out(TransportOut::PeerShutdown);
                    return;
                }
            }
        }
    }
}

#[platform_async_trait()]
impl SubsystemHandler<TransportIn, TransportOut> for PeerConn {
    async fn messages(&mut self, msgs: Vec<TransportIn>) -> Vec<TransportOut> {
        for msg in msgs {
            let cmd = match msg {
                TransportIn::Send(bytes) => WriterCmd::Send(bytes),
                TransportIn::Flush => WriterCmd::Flush,
                TransportIn::NotifyWhenDelivered(token) => WriterCmd::Notify(token),
            };
            if self.send.send(cmd).is_err() {
                return vec![TransportOut::PeerShutdown];
            }
        }
        vec![]
    }
}

/// Accepts inbound peer connections and hands each one over as a freshly
/// minted `Broker<TransportIn, TransportOut>`.
pub struct PeerListener;

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerOut {
    /// A new inbound TCP connection arrived; `id` is a process-local counter.
    Accepted(u64),
}

impl PeerListener {
    /// Binds `port` and spawns an accept loop. The returned channel yields
    /// the raw `TcpStream` for each new connection so the caller can perform
    /// the announcement handshake before wrapping it with [`PeerConn`].
    pub async fn bind(port: u16) -> std::io::Result<UnboundedReceiver<(u64, TcpStream)>> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let (tx, rx) = unbounded_channel();
        let counter = Arc::new(AtomicU64::new(0));
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let id = counter.fetch_add(1, Ordering::Relaxed);
                        if tx.send((id, stream)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("accept failed: {e}");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_receive_roundtrip() -> anyhow::Result<()> {
        let mut rx = PeerListener::bind(0).await.map_err(|e| anyhow::anyhow!(e))?;
        // bind(0) picks an ephemeral port; re-bind with a known one for the test.
        drop(rx);

        let mut accept_rx = PeerListener::bind(18765).await?;
        let mut client = PeerConn::connect("127.0.0.1:18765").await?;
        let (id, stream) = accept_rx.recv().await.expect("accepted connection");
        assert_eq!(id, 0);
        let mut server = PeerConn::from_stream(stream).await?;

        let mut client_tap = client.get_tap_out().await?.0;
        let mut server_tap = server.get_tap_out().await?.0;

        server.emit_msg_in(TransportIn::Send(Bytes::from_static(b"hello")))?;
        server.settle(vec![]).await?;

        let mut saw_it = false;
        for _ in 0..20 {
            if let Ok(TransportOut::Received(b)) = client_tap.try_recv() {
                assert_eq!(&b[..], b"hello");
                saw_it = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(saw_it, "client never saw the server's message");

        client.emit_msg_in(TransportIn::Send(Bytes::from_static(b"world")))?;
        client.settle(vec![]).await?;
        let mut saw_it = false;
        for _ in 0..20 {
            if let Ok(TransportOut::Received(b)) = server_tap.try_recv() {
                assert_eq!(&b[..], b"world");
                saw_it = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(saw_it, "server never saw the client's message");
        Ok(())
    }
}
