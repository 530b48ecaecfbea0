// ABOUTME: Library half of the dappbox server binary
// ABOUTME: Exposes config, telemetry and server setup so they can be tested

pub mod config;
pub mod server;
pub mod telemetry;

#[cfg(test)]
mod tests;
