//! Correlation of outbound queries with their responses.

use std::{collections::HashMap, fmt, time::Duration};

use rand::Rng;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::DhtError;

// The number of distinct tokens.
const TOKEN_SPACE: usize = 1 << 16;

/// A 2-byte KRPC transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; 2]);

impl Token {
    pub fn new(raw: [u8; 2]) -> Self {
        Self(raw)
    }

    /// Reads a token off the wire, `None` unless exactly 2 bytes long.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        raw.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    fn rand<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

/// Returned by [`TransactionRegistry::register`] when the registry is at capacity, hands the
/// continuation back.
#[derive(Debug, PartialEq, Eq)]
pub struct Full<C>(pub C);

#[derive(Debug)]
struct Transaction<C> {
    issued_at: OffsetDateTime,
    deadline: OffsetDateTime,
    continuation: C,
}

/// Tracks outstanding queries and what to do once they complete.
///
/// Every entry carries a deadline: [`TransactionRegistry::sweep`] hands back the expired ones so
/// their continuations can be resolved with [`DhtError::Timeout`]. The registry never grows past
/// `max_pending` entries.
#[derive(Debug)]
pub struct TransactionRegistry<C> {
    pending: HashMap<Token, Transaction<C>>,
    max_pending: usize,
}

impl<C> TransactionRegistry<C> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending,
        }
    }

    /// Generates a token not currently in use.
    pub fn new_token<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Token, DhtError> {
        if self.is_full() {
            return Err(DhtError::TooManyPending);
        }

        loop {
            let token = Token::rand(rng);
            if !self.pending.contains_key(&token) {
                return Ok(token);
            }
        }
    }

    /// Registers a continuation under the token, resolved at the latest `timeout` after `now`.
    pub fn register(
        &mut self,
        token: Token,
        continuation: C,
        timeout: Duration,
        now: OffsetDateTime,
    ) -> Result<(), Full<C>> {
        // Replacing an existing entry wouldn't grow the map.
        if self.is_full() && !self.pending.contains_key(&token) {
            return Err(Full(continuation));
        }

        let transaction = Transaction {
            issued_at: now,
            deadline: now + timeout,
            continuation,
        };

        if self.pending.insert(token, transaction).is_some() {
            warn!("transaction {token} was overwritten");
        }

        Ok(())
    }

    /// Removes the transaction and returns its continuation, `None` for unknown or already
    /// resolved tokens.
    pub fn resolve(&mut self, token: &Token) -> Option<C> {
        self.pending
            .remove(token)
            .map(|transaction| transaction.continuation)
    }

    /// Drops the transaction without resolving it, returning its continuation.
    pub fn cancel(&mut self, token: &Token) -> Option<C> {
        self.resolve(token)
    }

    /// Removes and returns every transaction whose deadline is at or before `now`, oldest first.
    pub fn sweep(&mut self, now: OffsetDateTime) -> Vec<(Token, C)> {
        let expired: Vec<Token> = self
            .pending
            .iter()
            .filter(|(_, transaction)| transaction.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        let mut swept: Vec<_> = expired
            .into_iter()
            .filter_map(|token| {
                self.pending
                    .remove(&token)
                    .map(|transaction| (transaction.issued_at, token, transaction.continuation))
            })
            .collect();
        swept.sort_by_key(|(issued_at, ..)| *issued_at);

        swept
            .into_iter()
            .map(|(_, token, continuation)| (token, continuation))
            .collect()
    }

    /// Returns a reference to the continuation if the token is pending.
    pub fn get(&self, token: &Token) -> Option<&C> {
        self.pending
            .get(token)
            .map(|transaction| &transaction.continuation)
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.pending.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` once `max_pending` transactions are outstanding or every token is taken.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending.min(TOKEN_SPACE)
    }

    /// Iterates over the pending continuations.
    pub fn continuations(&self) -> impl Iterator<Item = &C> {
        self.pending
            .values()
            .map(|transaction| &transaction.continuation)
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn token_from_bytes() {
        assert_eq!(Token::from_bytes(&[0xab, 0x01]), Some(Token::new([0xab, 0x01])));
        assert!(Token::from_bytes(&[1]).is_none());
        assert!(Token::from_bytes(&[1, 2, 3]).is_none());
        assert_eq!(Token::new([0xab, 0x01]).to_string(), "ab01");
    }

    #[test]
    fn register_and_resolve() {
        let mut rng = thread_rng();
        let mut registry = TransactionRegistry::new(16);
        let now = OffsetDateTime::now_utc();

        let token = registry.new_token(&mut rng).unwrap();
        registry.register(token, "ping", TIMEOUT, now).unwrap();

        assert!(registry.contains(&token));
        assert_eq!(registry.resolve(&token), Some("ping"));
        // At most once.
        assert_eq!(registry.resolve(&token), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn new_token_avoids_pending() {
        let mut rng = thread_rng();
        let mut registry = TransactionRegistry::new(1 << 16);
        let now = OffsetDateTime::now_utc();

        for i in 0..1000 {
            let token = registry.new_token(&mut rng).unwrap();
            assert!(!registry.contains(&token));
            registry.register(token, i, TIMEOUT, now).unwrap();
        }

        assert_eq!(registry.len(), 1000);
    }

    #[test]
    fn bounded() {
        let mut rng = thread_rng();
        let mut registry = TransactionRegistry::new(2);
        let now = OffsetDateTime::now_utc();

        registry.register(Token::new([0, 1]), (), TIMEOUT, now).unwrap();
        registry.register(Token::new([0, 2]), (), TIMEOUT, now).unwrap();

        assert_eq!(
            registry.register(Token::new([0, 3]), (), TIMEOUT, now),
            Err(Full(()))
        );
        assert!(matches!(
            registry.new_token(&mut rng),
            Err(DhtError::TooManyPending)
        ));

        registry.resolve(&Token::new([0, 1]));
        assert!(registry.register(Token::new([0, 3]), (), TIMEOUT, now).is_ok());
    }

    #[test]
    fn cancel() {
        let mut registry = TransactionRegistry::new(4);
        let token = Token::new([4, 2]);
        registry
            .register(token, 42, TIMEOUT, OffsetDateTime::now_utc())
            .unwrap();

        assert_eq!(registry.cancel(&token), Some(42));
        assert_eq!(registry.resolve(&token), None);
    }

    #[test]
    fn sweep_expires_after_timeout() {
        let mut registry = TransactionRegistry::new(4);
        let start = OffsetDateTime::now_utc();
        let timeout = Duration::from_millis(50);

        let token = Token::new([1, 1]);
        registry.register(token, "slow", timeout, start).unwrap();

        assert!(registry
            .sweep(start + Duration::from_millis(49))
            .is_empty());
        assert!(registry.contains(&token));

        let swept = registry.sweep(start + timeout);
        assert_eq!(swept, vec![(token, "slow")]);
        assert!(registry.is_empty());

        // A late response finds nothing.
        assert_eq!(registry.resolve(&token), None);
    }

    #[test]
    fn sweep_only_expired_oldest_first() {
        let mut registry = TransactionRegistry::new(8);
        let start = OffsetDateTime::now_utc();

        registry
            .register(Token::new([0, 2]), 2, TIMEOUT, start + Duration::from_secs(2))
            .unwrap();
        registry
            .register(Token::new([0, 1]), 1, TIMEOUT, start + Duration::from_secs(1))
            .unwrap();
        registry
            .register(Token::new([0, 9]), 9, TIMEOUT, start + Duration::from_secs(60))
            .unwrap();

        let swept: Vec<_> = registry
            .sweep(start + Duration::from_secs(30))
            .into_iter()
            .map(|(_, c)| c)
            .collect();

        assert_eq!(swept, vec![1, 2]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&Token::new([0, 9])), Some(&9));
    }
}
