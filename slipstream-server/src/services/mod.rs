//! Collaborators the resolver depends on, each behind a trait with an
//! in-process implementation and, where it applies, a Postgres one.

pub mod checkpoint_store;
pub mod checkpoint_writer;
pub mod fanout;
pub mod lease;
pub mod persistence;
pub mod storage;
pub mod title;
