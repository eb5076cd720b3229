//! # foreman-llm
//!
//! Normalizes the external AI responder into one ordered fragment sequence.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`streaming`] | `StreamingResponder`: numbering, chunking, error folding, cancellation |
//! | [`chunk`] | Deterministic splitting of single-value answers |
//! | [`retry`] | `RetryingResponder`: backoff for transient failures before output starts |
//! | [`mock`] | Scripted responder for tests |
//! | [`echo`] | Development responder that streams the question back |

#![deny(unsafe_code)]

pub mod chunk;
pub mod echo;
pub mod mock;
pub mod retry;
pub mod streaming;

pub use chunk::{ChunkConfig, chunk_text};
pub use echo::EchoResponder;
pub use mock::{MockReply, MockResponder};
pub use retry::{RetryConfig, RetryingResponder};
pub use streaming::{FragmentSequence, RESPONDER_FAILURE_CODE, StreamingResponder};
