//! Single-flight coalescing of concurrent runs for the same key.
//!
//! The first caller for a key becomes the leader and executes; callers that
//! arrive while it is in flight subscribe and receive a clone of its
//! outcome. If the leader goes away without publishing (its caller was
//! cancelled), subscribers see the channel close and race to lead again.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::outcome::DispatchOutcome;
use super::work::WorkKey;

/// Role handed out by [`InFlightRegistry::join`].
pub enum Flight<'a, R: Clone> {
    /// Execute and publish through the guard.
    Leader(LeaderGuard<'a, R>),
    /// Wait for the leader's outcome.
    Follower(broadcast::Receiver<DispatchOutcome<R>>),
}

/// Tracks which keys have an execution in flight.
pub struct InFlightRegistry<R: Clone> {
    flights: Mutex<HashMap<WorkKey, broadcast::Sender<DispatchOutcome<R>>>>,
}

impl<R: Clone> Default for InFlightRegistry<R> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Clone> fmt::Debug for InFlightRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl<R: Clone> InFlightRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead `key` if nobody is, otherwise follow the current leader.
    pub fn join(&self, key: &WorkKey) -> Flight<'_, R> {
        let mut flights = self.flights.lock();
        if let Some(sender) = flights.get(key) {
            return Flight::Follower(sender.subscribe());
        }

        let (sender, _) = broadcast::channel(1);
        flights.insert(key.clone(), sender);
        Flight::Leader(LeaderGuard {
            registry: self,
            key: key.clone(),
            published: false,
        })
    }

    /// Keys currently in flight.
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Leadership of one key. Dropping without [`publish`](Self::publish)
/// releases the key and wakes followers with a closed channel.
pub struct LeaderGuard<'a, R: Clone> {
    registry: &'a InFlightRegistry<R>,
    key: WorkKey,
    published: bool,
}

impl<R: Clone> LeaderGuard<'_, R> {
    /// Hand `outcome` to every follower. Returns how many received it.
    pub fn publish(mut self, outcome: DispatchOutcome<R>) -> usize {
        self.published = true;
        let sender = self.registry.flights.lock().remove(&self.key);
        sender.map_or(0, |sender| sender.send(outcome).unwrap_or(0))
    }
}

impl<R: Clone> Drop for LeaderGuard<'_, R> {
    fn drop(&mut self) {
        if !self.published {
            self.registry.flights.lock().remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SkipReason;

    fn key() -> WorkKey {
        WorkKey::new("shared").unwrap()
    }

    #[tokio::test]
    async fn test_follower_receives_leader_outcome() {
        let registry: InFlightRegistry<u32> = InFlightRegistry::new();
        let leader = match registry.join(&key()) {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller must lead"),
        };
        let mut follower = match registry.join(&key()) {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second caller must follow"),
        };

        let delivered = leader.publish(DispatchOutcome::skipped(SkipReason::Throttled));
        assert_eq!(delivered, 1);
        assert_eq!(
            follower.recv().await.unwrap(),
            DispatchOutcome::skipped(SkipReason::Throttled)
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_leader_closes_channel() {
        let registry: InFlightRegistry<u32> = InFlightRegistry::new();
        let leader = registry.join(&key());
        let mut follower = match registry.join(&key()) {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second caller must follow"),
        };

        drop(leader);
        assert!(follower.recv().await.is_err());
        assert!(matches!(registry.join(&key()), Flight::Leader(_)));
    }

    #[test]
    fn test_distinct_keys_lead_independently() {
        let registry: InFlightRegistry<u32> = InFlightRegistry::new();
        let _a = registry.join(&WorkKey::new("a").unwrap());
        let b = registry.join(&WorkKey::new("b").unwrap());
        assert!(matches!(b, Flight::Leader(_)));
        assert_eq!(registry.len(), 2);
    }
}
