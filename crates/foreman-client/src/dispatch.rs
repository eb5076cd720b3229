//! Typed event dispatch.
//!
//! Handlers register against an [`EventKind`]; every update the transport
//! produces maps to exactly one kind. Handlers run inline on the transport
//! task, so they should hand work off rather than block.

use std::collections::HashMap;
use std::sync::Arc;

use foreman_core::ServerEvent;
use parking_lot::RwLock;

use crate::assembler::AssembledMessage;
use crate::typing::TypingUpdate;

/// Transport lifecycle notices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// A lost transport came back. History should be re-fetched.
    Reconnected { attempts: u32 },
    /// The transport dropped unintentionally; reconnection is under way.
    Disconnected { reason: String },
    /// Reconnection gave up (or the server refused the credentials).
    Failed { code: String, detail: String },
}

/// Everything a UI layer can observe.
#[derive(Clone, Debug)]
pub enum ClientUpdate {
    Server(ServerEvent),
    Assembled(AssembledMessage),
    Typing(TypingUpdate),
    Notice(Notice),
}

/// Dispatch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Ack,
    Message,
    StreamStart,
    StreamChunk,
    StreamEnd,
    Reaction,
    Error,
    /// A streamed answer finished (or was abandoned) and was reassembled.
    Assembled,
    Typing,
    Notice,
}

impl ClientUpdate {
    /// Kind used for dispatch. Heartbeats never reach handlers.
    pub fn kind(&self) -> Option<EventKind> {
        Some(match self {
            Self::Server(event) => match event {
                ServerEvent::Connected { .. } => EventKind::Connected,
                ServerEvent::Ack { .. } => EventKind::Ack,
                ServerEvent::Message { .. } => EventKind::Message,
                ServerEvent::StreamStart { .. } => EventKind::StreamStart,
                ServerEvent::StreamChunk { .. } => EventKind::StreamChunk,
                ServerEvent::StreamEnd { .. } => EventKind::StreamEnd,
                ServerEvent::Reaction { .. } => EventKind::Reaction,
                ServerEvent::Error { .. } => EventKind::Error,
                ServerEvent::Typing { .. } => EventKind::Typing,
                ServerEvent::Ping => return None,
            },
            Self::Assembled(_) => EventKind::Assembled,
            Self::Typing(_) => EventKind::Typing,
            Self::Notice(_) => EventKind::Notice,
        })
    }
}

pub type Handler = Arc<dyn Fn(&ClientUpdate) + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, handler: impl Fn(&ClientUpdate) + Send + Sync + 'static) {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke every handler for the update's kind, in registration order.
    pub fn emit(&self, update: &ClientUpdate) {
        let Some(kind) = update.kind() else {
            return;
        };
        // Clone out so a handler may register further handlers.
        let handlers: Vec<Handler> = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for handler in handlers {
            handler(update);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<EventKind> = self.handlers.read().keys().copied().collect();
        f.debug_struct("Dispatcher").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use foreman_core::{Identity, MessageId};

    use super::*;

    #[test]
    fn routes_by_kind_in_registration_order() {
        let d = Dispatcher::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            d.on(EventKind::Error, move |_| order.lock().push(tag));
        }
        let chunks = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&chunks);
        d.on(EventKind::StreamChunk, move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });

        d.emit(&ClientUpdate::Server(ServerEvent::Error {
            code: "RATE_LIMITED".into(),
            detail: "slow down".into(),
        }));
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(chunks.load(Ordering::SeqCst), 0);

        d.emit(&ClientUpdate::Server(ServerEvent::StreamChunk {
            message_id: MessageId::from_raw("msg_1"),
            sequence_number: 0,
            content: "x".into(),
        }));
        assert_eq!(chunks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ping_is_not_dispatched() {
        assert_eq!(ClientUpdate::Server(ServerEvent::Ping).kind(), None);
        let d = Dispatcher::new();
        d.emit(&ClientUpdate::Server(ServerEvent::Ping));
    }

    #[test]
    fn typing_updates_and_raw_typing_share_a_kind() {
        let raw = ClientUpdate::Server(ServerEvent::Typing {
            identity: Identity::new("u"),
        });
        let tracked = ClientUpdate::Typing(TypingUpdate {
            identity: Identity::new("u"),
            active: true,
        });
        assert_eq!(raw.kind(), Some(EventKind::Typing));
        assert_eq!(tracked.kind(), Some(EventKind::Typing));
    }

    #[test]
    fn handler_may_register_another() {
        let d = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&d);
        d.on(EventKind::Notice, move |_| inner.on(EventKind::Notice, |_| {}));
        d.emit(&ClientUpdate::Notice(Notice::Disconnected {
            reason: "eof".into(),
        }));
        assert_eq!(d.handler_count(EventKind::Notice), 2);
    }
}
