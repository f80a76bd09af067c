//! Receive wired and wireless m-bus telegrams from radio dongles or
//! pipes, authenticate and decrypt them, decode the dif/vif record stream
//! and hand structured readings to the output side.

pub mod address;
pub mod bus;
pub mod config;
pub mod drivers;
pub mod linkmode;
pub mod meters;
pub mod output;
pub mod telegram;
pub mod units;

// Re-export the types nearly every caller wants.
pub use address::{Address, AddressExpression};
pub use bus::{BusManager, TelegramFormat};
pub use config::{Config, MeterConfig};
pub use drivers::{find_driver, DriverInfo};
pub use linkmode::{LinkMode, LinkModeSet};
pub use meters::{Meter, MeterManager};
pub use output::{Format, Transmission};
pub use telegram::{AboutTelegram, Telegram};
pub use units::{Quantity, Unit};

pub fn get_unix_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
