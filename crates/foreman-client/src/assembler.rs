//! Reassembly of streamed answer fragments.
//!
//! Chunks are keyed by `(session, message)` and placed by sequence number,
//! never by arrival order. A gap, a count that disagrees with `stream_end`,
//! or a non-complete terminal status all flag the result as possibly
//! incomplete; only the contiguous prefix is ever concatenated.

use std::collections::{BTreeMap, HashMap};

use foreman_core::{MessageId, SessionId, StreamEndMetadata, StreamStatus};

/// What happened to a pushed chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Extended the contiguous content (possibly draining buffered chunks).
    Appended,
    /// Arrived ahead of a missing sequence number and was held back.
    Buffered,
    /// Sequence number already seen.
    Duplicate,
}

/// A finished (or abandoned) assistant answer as seen by this client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledMessage {
    pub session_id: SessionId,
    pub message_id: MessageId,
    /// Contiguous content from sequence 0 up to the first gap.
    pub content: String,
    /// Distinct chunks received.
    pub received: u64,
    /// Chunk count announced by the server, if the stream ended.
    pub expected: Option<u64>,
    /// Terminal status, or `None` when the transport dropped mid-stream.
    pub status: Option<StreamStatus>,
    pub possibly_incomplete: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Partial {
    content: String,
    next: u64,
    received: u64,
    pending: BTreeMap<u64, String>,
}

impl Partial {
    fn push(&mut self, seq: u64, content: &str) -> PushOutcome {
        if seq < self.next || self.pending.contains_key(&seq) {
            return PushOutcome::Duplicate;
        }
        self.received += 1;
        if seq > self.next {
            let _ = self.pending.insert(seq, content.to_string());
            return PushOutcome::Buffered;
        }
        self.content.push_str(content);
        self.next += 1;
        while let Some(next) = self.pending.remove(&self.next) {
            self.content.push_str(&next);
            self.next += 1;
        }
        PushOutcome::Appended
    }

    fn has_gap(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// In-flight answers for one client.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    partials: HashMap<(SessionId, MessageId), Partial>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking an answer. A repeated start keeps what was received.
    pub fn start(&mut self, session_id: &SessionId, message_id: &MessageId) {
        let _ = self
            .partials
            .entry((session_id.clone(), message_id.clone()))
            .or_default();
    }

    /// Add one chunk. Chunks for an answer that was never started begin
    /// tracking implicitly.
    pub fn push(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        sequence_number: u64,
        content: &str,
    ) -> PushOutcome {
        self.partials
            .entry((session_id.clone(), message_id.clone()))
            .or_default()
            .push(sequence_number, content)
    }

    /// Live contiguous content of an in-flight answer.
    pub fn current(&self, session_id: &SessionId, message_id: &MessageId) -> Option<&str> {
        self.partials
            .get(&(session_id.clone(), message_id.clone()))
            .map(|p| p.content.as_str())
    }

    /// Close out an answer on `stream_end`.
    pub fn finish(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        metadata: &StreamEndMetadata,
    ) -> AssembledMessage {
        let partial = self
            .partials
            .remove(&(session_id.clone(), message_id.clone()))
            .unwrap_or_default();
        let possibly_incomplete = metadata.incomplete
            || metadata.status != StreamStatus::Complete
            || partial.has_gap()
            || partial.received != metadata.fragment_count;
        AssembledMessage {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            content: partial.content,
            received: partial.received,
            expected: Some(metadata.fragment_count),
            status: Some(metadata.status),
            possibly_incomplete,
            error: metadata.error.clone(),
        }
    }

    /// Drop every in-flight answer, e.g. when the transport is lost. Each is
    /// returned flagged as possibly incomplete.
    pub fn abandon_all(&mut self) -> Vec<AssembledMessage> {
        let mut out: Vec<_> = self
            .partials
            .drain()
            .map(|((session_id, message_id), partial)| AssembledMessage {
                session_id,
                message_id,
                content: partial.content,
                received: partial.received,
                expected: None,
                status: None,
                possibly_incomplete: true,
                error: Some("connection lost before the answer finished".into()),
            })
            .collect();
        out.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        out
    }

    /// Session an in-flight answer belongs to (chunks carry only the message id).
    pub fn session_of(&self, message_id: &MessageId) -> Option<SessionId> {
        self.partials
            .keys()
            .find(|(_, m)| m == message_id)
            .map(|(s, _)| s.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (SessionId, MessageId) {
        (SessionId::from_raw("sess_1"), MessageId::from_raw("msg_1"))
    }

    fn end(status: StreamStatus, count: u64) -> StreamEndMetadata {
        StreamEndMetadata {
            status,
            fragment_count: count,
            latency_ms: 5,
            incomplete: status != StreamStatus::Complete,
            error: None,
        }
    }

    #[test]
    fn in_order_stream_is_complete() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        asm.start(&s, &m);
        assert_eq!(asm.session_of(&m), Some(s.clone()));
        assert_eq!(asm.push(&s, &m, 0, "Two "), PushOutcome::Appended);
        assert_eq!(asm.push(&s, &m, 1, "RFIs "), PushOutcome::Appended);
        assert_eq!(asm.push(&s, &m, 2, "open."), PushOutcome::Appended);
        assert_eq!(asm.current(&s, &m), Some("Two RFIs open."));

        let done = asm.finish(&s, &m, &end(StreamStatus::Complete, 3));
        assert_eq!(done.content, "Two RFIs open.");
        assert!(!done.possibly_incomplete);
        assert_eq!(asm.in_flight(), 0);
    }

    #[test]
    fn out_of_order_chunk_is_placed_by_sequence() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        assert_eq!(asm.push(&s, &m, 0, "a"), PushOutcome::Appended);
        assert_eq!(asm.push(&s, &m, 2, "c"), PushOutcome::Buffered);
        assert_eq!(asm.current(&s, &m), Some("a"));
        assert_eq!(asm.push(&s, &m, 1, "b"), PushOutcome::Appended);
        assert_eq!(asm.current(&s, &m), Some("abc"));
        let done = asm.finish(&s, &m, &end(StreamStatus::Complete, 3));
        assert!(!done.possibly_incomplete);
    }

    #[test]
    fn gap_flags_incomplete_and_keeps_prefix_only() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        let _ = asm.push(&s, &m, 0, "a");
        let _ = asm.push(&s, &m, 2, "c");
        let done = asm.finish(&s, &m, &end(StreamStatus::Complete, 3));
        assert_eq!(done.content, "a");
        assert_eq!(done.received, 2);
        assert!(done.possibly_incomplete);
    }

    #[test]
    fn duplicates_are_ignored() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        let _ = asm.push(&s, &m, 0, "a");
        assert_eq!(asm.push(&s, &m, 0, "a"), PushOutcome::Duplicate);
        let _ = asm.push(&s, &m, 2, "c");
        assert_eq!(asm.push(&s, &m, 2, "c"), PushOutcome::Duplicate);
        let _ = asm.push(&s, &m, 1, "b");
        let done = asm.finish(&s, &m, &end(StreamStatus::Complete, 3));
        assert_eq!(done.content, "abc");
        assert_eq!(done.received, 3);
        assert!(!done.possibly_incomplete);
    }

    #[test]
    fn count_mismatch_flags_incomplete() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        let _ = asm.push(&s, &m, 0, "a");
        let done = asm.finish(&s, &m, &end(StreamStatus::Complete, 2));
        assert!(done.possibly_incomplete);
    }

    #[test]
    fn errored_stream_is_incomplete_even_without_gap() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        let _ = asm.push(&s, &m, 0, "Budget ");
        let _ = asm.push(&s, &m, 1, "is ");
        let mut meta = end(StreamStatus::Errored, 2);
        meta.error = Some("responder failure".into());
        let done = asm.finish(&s, &m, &meta);
        assert_eq!(done.content, "Budget is ");
        assert!(done.possibly_incomplete);
        assert_eq!(done.error.as_deref(), Some("responder failure"));
    }

    #[test]
    fn same_message_id_in_different_sessions_is_separate() {
        let m = MessageId::from_raw("msg_1");
        let (a, b) = (SessionId::from_raw("sess_a"), SessionId::from_raw("sess_b"));
        let mut asm = FragmentAssembler::new();
        let _ = asm.push(&a, &m, 0, "x");
        let _ = asm.push(&b, &m, 0, "y");
        assert_eq!(asm.current(&a, &m), Some("x"));
        assert_eq!(asm.current(&b, &m), Some("y"));
    }

    #[test]
    fn abandon_all_marks_everything_incomplete() {
        let (s, m) = ids();
        let mut asm = FragmentAssembler::new();
        asm.start(&s, &m);
        let _ = asm.push(&s, &m, 0, "partial");
        let abandoned = asm.abandon_all();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].content, "partial");
        assert!(abandoned[0].possibly_incomplete);
        assert_eq!(abandoned[0].status, None);
        assert_eq!(asm.in_flight(), 0);
    }
}
