//! Internal data structures.
//!
//! [`Slab`] is the fixed-capacity slot arena backing the reactor
//! registry: indices are small, reusable, and never exceed the capacity
//! the manager was configured with.

mod slab;

pub(crate) use slab::Slab;
