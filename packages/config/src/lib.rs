// ABOUTME: Configuration crate shared by the Dappbox service packages
// ABOUTME: Re-exports the environment variable names so readers never hard-code them

pub mod constants;

pub use constants::*;
