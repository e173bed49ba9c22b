//! Core MPSC (Multi-Producer Single-Consumer) ring primitives.
//!
//! This module contains the versioned ring algorithm shared by:
//! - [`crate::sync::mpsc`] - In-process channels over heap memory
//! - [`crate::ipc::mpsc`] - Cross-process channels over shared memory

pub(crate) mod ring;
