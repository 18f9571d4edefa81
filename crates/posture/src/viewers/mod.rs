//! Consumer side: viewer sessions, their stream workers and status broadcast.

pub mod broadcast;
pub mod registry;
