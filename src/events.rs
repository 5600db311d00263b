use std::net::SocketAddr;

use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::Token;

/// Notifications about what the proxy is doing. Mainly intended for tests and diagnostics, nothing inside the proxy
/// depends on them.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum ProxyEvent {
    /// A client connection was accepted on the listening socket.
    Accepted(Option<SocketAddr>),
    /// The connection to the remote endpoint was established and both directions were registered.
    Paired { client: Token, remote: Token },
    /// The connection to the remote endpoint failed, the client connection has been closed.
    ConnectFailed(Option<SocketAddr>),
    /// A chunk read from `from` was queued for delivery.
    Enqueued { from: Token, bytes: usize },
    /// The read direction of `from` has ended.
    ReadClosed(Token),
    /// A chunk was completely written to `to`.
    Delivered { to: Token, bytes: usize },
    /// The output direction of `to` was shut down (or the socket was closed completely).
    OutputClosed(Token),
}

/// Sending side shared by the reading and the relay thread. Sending never blocks, and events are simply dropped if
/// nobody has subscribed or the subscriber has gone away.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    senders: Vec<Sender<ProxyEvent>>,
}

impl EventSink {
    pub fn subscribe(&mut self) -> Receiver<ProxyEvent> {
        let (tx, rx) = unbounded::<ProxyEvent>();
        self.senders.push(tx);
        rx
    }

    pub fn emit(&self, event: ProxyEvent) {
        for tx in &self.senders {
            let _ = tx.send(event.clone());
        }
    }
}
