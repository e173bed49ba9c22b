//! Core SPSC (Single-Producer Single-Consumer) ring primitives.
//!
//! This module contains the versioned ring algorithm shared by:
//! - [`crate::sync::spsc`] - In-process channels over heap memory
//! - [`crate::ipc::spsc`] - Cross-process channels over shared memory

pub(crate) mod ring;
