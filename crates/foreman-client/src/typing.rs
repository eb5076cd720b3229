use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use foreman_core::Identity;
use parking_lot::Mutex;

/// Typing indicator change for one participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypingUpdate {
    pub identity: Identity,
    pub active: bool,
}

type Emit = Arc<dyn Fn(TypingUpdate) + Send + Sync>;

/// Self-expiring typing indicators.
///
/// Each `observe` stamps the identity with a fresh generation and schedules an expiry;
/// only the expiry matching the latest generation clears the indicator, so
/// refreshes extend it and a lost final event cannot leave it stuck on.
#[derive(Clone)]
pub struct TypingTracker {
    ttl: Duration,
    state: Arc<Mutex<State>>,
    emit: Emit,
}

#[derive(Default)]
struct State {
    next_generation: u64,
    active: HashMap<Identity, u64>,
}

impl TypingTracker {
    pub fn new(ttl: Duration, emit: impl Fn(TypingUpdate) + Send + Sync + 'static) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(State::default())),
            emit: Arc::new(emit),
        }
    }

    /// Record a typing event. Must be called within a Tokio runtime.
    pub fn observe(&self, identity: &Identity) {
        let (generation, newly_active) = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            let previous = state.active.insert(identity.clone(), generation);
            (generation, previous.is_none())
        };
        if newly_active {
            (self.emit)(TypingUpdate {
                identity: identity.clone(),
                active: true,
            });
        }

        let tracker = self.clone();
        let identity = identity.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(tracker.ttl).await;
            tracker.expire(&identity, generation);
        });
    }

    fn expire(&self, identity: &Identity, generation: u64) {
        let expired = {
            let mut state = self.state.lock();
            if state.active.get(identity) == Some(&generation) {
                let _ = state.active.remove(identity);
                true
            } else {
                false
            }
        };
        if expired {
            (self.emit)(TypingUpdate {
                identity: identity.clone(),
                active: false,
            });
        }
    }

    pub fn is_typing(&self, identity: &Identity) -> bool {
        self.state.lock().active.contains_key(identity)
    }

    /// Clear every indicator at once (transport lost).
    pub fn clear(&self) {
        let cleared: Vec<Identity> = self.state.lock().active.drain().map(|(id, _)| id).collect();
        for identity in cleared {
            (self.emit)(TypingUpdate {
                identity,
                active: false,
            });
        }
    }
}

impl std::fmt::Debug for TypingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingTracker")
            .field("ttl", &self.ttl)
            .field("active", &self.state.lock().active.len())
            .finish_non_exhaustive()
    }
}
