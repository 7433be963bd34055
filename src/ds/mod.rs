//! Shared data structures

pub mod bitmask_array;

pub use bitmask_array::BitmaskArray;
