//! Domain services used by the HTTP routes and the generation workers.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business rules and talk to the datastore through the
//! `Store` trait so route handlers can stay focused on request parsing,
//! auth and status mapping.

pub mod generation;
pub mod ledger;
pub mod payment;
pub mod project;
pub mod worker;
