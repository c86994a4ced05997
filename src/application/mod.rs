//! Application services: catalog refresh, refresh coordination and reads.

pub mod commands;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod mailbox;
pub mod plans;
pub mod refresh;
pub mod repos;
pub mod worker;
