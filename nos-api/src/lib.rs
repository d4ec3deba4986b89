//! NOS API - Shared types and collaborator interfaces for the NOS kernel
//!
//! This crate holds the vocabulary shared between the concurrency core and
//! the subsystems it consumes but does not own:
//!
//! - **Core**: identifier and address type aliases
//! - **Error**: the common error type and `Result` alias
//! - **Memory**: the address-space translation interface used by futexes
//!
//! # Usage
//!
//! ```rust
//! use nos_api::memory::interface::AddressSpace;
//! use nos_api::{Error, PhysAddr, Result, VirtAddr};
//!
//! struct Identity;
//!
//! impl AddressSpace for Identity {
//!     fn translate(&self, virt: VirtAddr) -> Result<PhysAddr> {
//!         if virt == 0 {
//!             return Err(Error::NotMapped(virt));
//!         }
//!         Ok(virt)
//!     }
//! }
//!
//! assert_eq!(Identity.translate(0x1000), Ok(0x1000));
//! ```

#![no_std]

// Core modules
pub mod core;
pub mod error;
pub mod memory;

// Re-export commonly used types
pub use crate::core::types::*;
pub use crate::error::{Error, Result};
pub use crate::memory::interface::AddressSpace;
