// src/events/mod.rs
// Search-track events and the workers that turn them into chat replies

pub mod model;
pub mod sink;
pub mod worker;

pub use model::{DecodeError, EventKind, SearchTrackEvent, SearchTrackRequest, SearchTrackResponse};
pub use sink::{parse_chat_id, ChatSink, Destination, LogSink, MemorySink, SinkError};
pub use worker::{
    LookupFailurePolicy, Outcome, Worker, WorkerPool, WorkerSettings, DEFAULT_FAILURE_REPLY,
};
