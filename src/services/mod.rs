//! The relay's components, leaves first: persisted state, payload cleaning,
//! remote delivery, the cloud source, alerting, and the orchestrator that
//! drives them.

pub mod drive;
pub mod notifier;
pub mod orchestrator;
pub mod run_lock;
pub mod sftp;
pub mod source;
pub mod state_store;
pub mod transformer;
pub mod transporter;

#[cfg(test)]
pub(crate) mod fakes;
