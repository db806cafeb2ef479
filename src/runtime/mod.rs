//! Runtime system
//!
//! This module contains the concurrency scheduler.

pub mod scheduler;
