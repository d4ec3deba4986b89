//! Core types shared by every NOS kernel component

pub mod types;
