//! Event store adapter: the append-only log the rest of the engine is built
//! on. Provides `Append(aggregateID, expectedSeq, events)`,
//! `Read(aggregateID, fromSeq)`, and replay-to-state helpers, backed by
//! either PostgreSQL or an in-memory store for tests.

pub mod error;
pub mod events;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod replay;
pub mod store;

pub use error::*;
pub use events::*;
pub use memory::*;
pub use pool::*;
pub use postgres::*;
pub use replay::*;
pub use store::*;
