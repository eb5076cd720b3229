use foreman_core::{ConnectionId, ServerEvent, SessionId};

/// Outbound seam of the orchestrator: fan an event out to whoever is
/// attached to a session. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, session_id: &SessionId, event: &ServerEvent, except: Option<&ConnectionId>);
}

#[cfg(test)]
pub(crate) mod recording {
    use parking_lot::Mutex;

    use super::*;

    /// Captures published events in order.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<(SessionId, ServerEvent)>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<(SessionId, ServerEvent)> {
            self.events.lock().clone()
        }

        pub(crate) fn type_names(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|(_, e)| e.type_name()).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, session_id: &SessionId, event: &ServerEvent, _except: Option<&ConnectionId>) {
            self.events.lock().push((session_id.clone(), event.clone()));
        }
    }
}
