//! Write side of the CQRS system.
//!
//! This crate provides:
//! - Aggregate trait for event-sourced entities
//! - DomainEvent trait for domain events
//! - Command trait and CommandHandler for command processing
//! - CommandPipeline, which appends events and drives the projector inline
//!   or through its worker queues

pub mod aggregate;
pub mod command;
pub mod error;
pub mod pipeline;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::{DomainError, PipelineError, Result};
pub use pipeline::{AppendOutput, CommandOutput, CommandPipeline, ConsistencyMode, PipelineConfig};
