//! Types shared between the sandboxd library and the server binary.

pub mod constants;
pub mod errors;

pub use errors::{SandboxError, SandboxResult};
