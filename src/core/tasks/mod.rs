// src/core/tasks/mod.rs

//! Background maintenance tasks.

pub mod expiry_sweeper;

pub use expiry_sweeper::ExpirySweeper;
