use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;

/// Anything that must not be handed out before a fixed point in time.
pub trait Delayed {
    /// The instant at which this value becomes eligible for delivery. Must not change over the lifetime of the value.
    fn eligible_at(&self) -> Instant;

    fn remaining_delay(&self) -> Duration {
        self.eligible_at().saturating_duration_since(Instant::now())
    }

    fn is_eligible(&self) -> bool {
        self.eligible_at() <= Instant::now()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes read from one side of a connection, in the length they were read.
    Data(Vec<u8>),
    /// The read side has ended: the destination's output is to be shut down.
    Close,
}

/// One chunk destined for one socket.
pub struct DelayedItem {
    chunk: Chunk,
    destination: Option<Arc<Endpoint>>,
    eligible_at: Instant,
}

impl DelayedItem {
    pub fn data(payload: Vec<u8>, destination: Arc<Endpoint>, eligible_at: Instant) -> Self {
        Self {
            chunk: Chunk::Data(payload),
            destination: Some(destination),
            eligible_at,
        }
    }

    pub fn close(destination: Option<Arc<Endpoint>>, eligible_at: Instant) -> Self {
        Self {
            chunk: Chunk::Close,
            destination,
            eligible_at,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn destination(&self) -> Option<&Arc<Endpoint>> {
        self.destination.as_ref()
    }

    /// The number of payload bytes, or -1 for the close sentinel.
    pub fn len(&self) -> isize {
        match &self.chunk {
            Chunk::Data(payload) => payload.len() as isize,
            Chunk::Close => -1,
        }
    }

    pub fn is_close(&self) -> bool {
        self.chunk == Chunk::Close
    }

    pub fn into_parts(self) -> (Chunk, Option<Arc<Endpoint>>) {
        (self.chunk, self.destination)
    }
}

impl Delayed for DelayedItem {
    fn eligible_at(&self) -> Instant {
        self.eligible_at
    }
}

impl fmt::Debug for DelayedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedItem")
            .field("len", &self.len())
            .field("destination", &self.destination.as_ref().map(|e| e.peer_addr()))
            .field("eligible_at", &self.eligible_at)
            .finish()
    }
}

// Items are ordered by eligibility only: two items with the same instant compare equal, whatever their payload.
impl PartialEq for DelayedItem {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at
    }
}

impl Eq for DelayedItem {}

impl PartialOrd for DelayedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.eligible_at.cmp(&other.eligible_at)
    }
}
