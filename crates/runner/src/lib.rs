#![forbid(unsafe_code)]

//! Worker side of the job queue: a polling loop that claims jobs, hands them to a
//! [`JobHandler`], and settles the outcome back into the store.

mod command;
pub mod defaults;
mod handler;
mod worker;

pub use command::CommandHandler;
pub use handler::{DryRunHandler, JobFailure, JobHandler};
pub use worker::{JobContext, Worker, WorkerConfig};

#[cfg(test)]
mod tests;
