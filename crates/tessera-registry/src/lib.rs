//! The party and site directory.
//!
//! [`Registry`] is the single writable copy, normally served by one site.
//! Every other site holds a [`RegistryClient`], a lease-bounded replica kept
//! current through the same replication protocol used for policy rules.

mod client;
mod error;
mod object;
mod registry;

pub use client::RegistryClient;
pub use error::RegistryError;
pub use object::RegisteredObject;
pub use registry::Registry;
