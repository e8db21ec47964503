mod config;
pub use config::NodeConfig;

pub mod chain;
pub mod channel;
pub mod contractcourt;
pub mod invoice;
pub mod store;
pub mod wire;

mod errors;
pub use errors::{Error, Result};

pub mod serde_utils;
pub mod tasks;

#[cfg(test)]
pub mod test_utils;

/// Wall clock time as unix nanoseconds. Invoice accept/resolve stamps use
/// this resolution so that the settle event series orders identically to the
/// settle index.
pub fn now_timestamp_as_nanos_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("duration since epoch")
        .as_nanos() as u64
}
