use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::delayed_item::{Chunk, DelayedItem};
use crate::delivery_queue::DeliveryQueue;
use crate::endpoint::CloseOutcome;
use crate::events::{EventSink, ProxyEvent};

/// Writes queued chunks to their destination once their delay has elapsed.
///
/// A single relay serves all connections in both directions, so chunks are written in the order they become
/// eligible, regardless of the connection they belong to. A chunk that takes long to write holds back all chunks
/// behind it.
pub struct Relay {
    queue: Arc<DeliveryQueue<DelayedItem>>,
    events: EventSink,
}

impl Relay {
    pub fn new(queue: Arc<DeliveryQueue<DelayedItem>>, events: EventSink) -> Self {
        Self { queue, events }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("relay".to_owned())
            .spawn(move || self.run())
    }

    /// Delivers items until the process terminates.
    pub fn run(self) -> ! {
        loop {
            let item = self.queue.pop_when_eligible();
            self.deliver(item);
        }
    }

    /// Writes a single item to its destination, or shuts down the destination's output if the item is a close
    /// sentinel or the write fails. Failures never propagate: they only affect the destination of this item.
    pub fn deliver(&self, item: DelayedItem) {
        let len = item.len();
        let (chunk, destination) = item.into_parts();
        let destination = match destination {
            Some(destination) => destination,
            None => {
                debug!("Discarding item of length {} without destination", len);
                return;
            }
        };
        let close = match chunk {
            Chunk::Close => true,
            Chunk::Data(payload) => match destination.write_all(&payload) {
                Ok(()) => {
                    debug!("Wrote {} bytes to {}", payload.len(), destination);
                    self.events.emit(ProxyEvent::Delivered { to: destination.token(), bytes: payload.len() });
                    false
                }
                Err(e) => {
                    debug!("Unable to write {} bytes to {}: {}", payload.len(), destination, e);
                    true
                }
            },
        };
        if close && destination.close_output() != CloseOutcome::Unchanged {
            self.events.emit(ProxyEvent::OutputClosed(destination.token()));
        }
    }
}
