//! Memory management interfaces consumed by the concurrency core

pub mod interface;
