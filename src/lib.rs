//! Event-sourced ledger with a tag-partitioned, checkpointed read side.
//!
//! The write side is one sequential worker per entity id, deriving state by
//! replaying the id's event history and appending one event per command. The
//! read side partitions the global event stream into a fixed number of tags,
//! each consumed by a checkpointed, backoff-supervised worker kept alive by
//! a cluster-singleton heartbeat. Cluster membership, leader election, and
//! the storage engine are consumed through traits; in-memory stand-ins are
//! provided for tests and single-node runs.

mod actor;
pub use actor::{EntityHandle, spawn_entity_worker};
mod checkpoint;
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
mod cluster;
pub use cluster::{ClusterCoordinator, NodeRef, StaticCoordinator};
mod config;
pub use config::LedgerConfig;
mod consumer;
pub use consumer::{EventSink, TagConsumer};
mod dispatcher;
pub use dispatcher::{
    CommandDispatcher, CommandPort, QueryDispatcher, QueryPort, RandomTraffic, TrafficSource,
};
mod entity;
pub use entity::Entity;
mod error;
pub use error::{
    CheckpointError, CommandError, ConsumerError, LogError, ReplayError, RouteError, SinkError,
    WorkerGone,
};
mod event;
pub use event::{EventInfo, LedgerEvent, StoredEvent, decode_event, encode_event};
mod heartbeat;
pub use heartbeat::{HEARTBEAT_ROLE, run_heartbeat};
mod journal;
pub use journal::{EventLog, EventStream, MemoryJournal, Position};
mod message;
pub use message::{Ack, Amount, Command, CommandInfo, EntityId, Query, QueryReply};
mod router;
pub use router::Router;
mod supervisor;
pub use supervisor::{BackoffConfig, run_supervised};
mod tag;
pub use tag::{Tag, all_tags, tag_for};
