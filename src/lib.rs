//! bcms-shim: control plane between the cloud service and per-tenant CMS
//! containers. Owns the instance lifecycle, keeps the reverse proxy routing
//! table in step with the instance set, and carries all cloud/instance
//! traffic over signed, encrypted, replay-protected envelopes.

pub mod cloud;
pub mod config;
pub mod error;
pub mod instance;
pub mod protocol;
pub mod proxy;
pub mod shim;
pub mod sys;

pub use error::{Result, ShimError};
pub use shim::Shim;
