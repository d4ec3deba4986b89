//! Time keeping: per-CPU timeout registries and the clock tick.

pub mod clock;
pub mod timeout;
