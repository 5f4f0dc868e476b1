pub mod carrier;
pub mod tnc;

mod error;

pub use carrier::CarrierSense;
pub use error::NetError;
pub use tnc::{send_frame, spawn_tnc, TncCommand, TncConfig, TncNotification};
