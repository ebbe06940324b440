//! Persisted configuration layout.
//!
//! The flash driver itself is out of scope for this crate (see
//! this crate); [`ConfigStore`] is the narrow interface the
//! controllers need from it, modeled on `sensor_config.c`'s
//! read-only-until-reconfigured accessors.

use crate::auth::AuthKey;
use crate::node::NodeId;

/// Per-node identity and the two HMAC keys for the status/config auth channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorNodeConfig {
    pub key_status: AuthKey,
    pub key_config: AuthKey,
    pub my_id: NodeId,
}

/// Tunables shared by every sensor channel on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MiscConfig {
    /// Seconds without an authenticated config-channel message before reboot.
    pub network_timeout_s: u32,
    /// Status-channel retransmissions before the node gives up and reboots.
    pub max_status_retransmissions: u32,
    pub rt_delay_random: u32,
    pub rt_delay_lin_div: u32,
}

impl Default for MiscConfig {
    fn default() -> Self {
        MiscConfig {
            network_timeout_s: 1800,
            max_status_retransmissions: 100,
            rt_delay_random: 10,
            rt_delay_lin_div: 3,
        }
    }
}

/// One 4-bit-per-LED color table entry; a node maps a `(channel, color
/// index)` pair from `MSG_TYPE_LED` through this table to get an actual RGB
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

pub const COLOR_TABLE_SIZE: usize = 16;
pub type ColorTable = [RgbColor; COLOR_TABLE_SIZE];

/// The flash read/write interface the controllers need. A real
/// implementation wraps the target's flash sector driver; `meshcore`'s
/// tests use an in-memory fake.
pub trait ConfigStore {
    fn node_config(&self) -> Option<SensorNodeConfig>;
    fn misc_config(&self) -> MiscConfig;
    fn color_table(&self) -> ColorTable;

    /// Persists a freshly-advanced auth nonce so a reboot doesn't replay one.
    fn save_nonce(&mut self, status_nonce: u64, config_nonce: u64);
    fn load_nonces(&self) -> (u64, u64);
}
