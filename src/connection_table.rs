use std::collections::HashMap;
use std::sync::Arc;

use mio::Token;

use crate::endpoint::Endpoint;

/// Maps the read side of each active direction to the socket its bytes are relayed to.
///
/// A connection between A and B is registered as two independent entries, A -> B and B -> A. The entry keyed by a
/// socket is removed as soon as that socket's read direction has ended.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    pairs: HashMap<Token, Arc<Endpoint>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pair(&mut self, a: &Arc<Endpoint>, b: &Arc<Endpoint>) {
        self.pairs.insert(a.token(), Arc::clone(b));
        self.pairs.insert(b.token(), Arc::clone(a));
    }

    pub fn peer_of(&self, token: Token) -> Option<&Arc<Endpoint>> {
        self.pairs.get(&token)
    }

    /// Removes the direction whose read side is `token`, returning the socket it used to be relayed to.
    pub fn remove(&mut self, token: Token) -> Option<Arc<Endpoint>> {
        self.pairs.remove(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.pairs.contains_key(&token)
    }

    /// The number of active directions (two per fully open connection).
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
