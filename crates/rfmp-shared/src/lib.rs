pub mod ax25;
pub mod constants;
pub mod frames;
pub mod kiss;
pub mod types;

mod error;

pub use error::FramingError;
pub use frames::{Frame, MsgFrame, SyncWindow};
pub use types::{Callsign, MessageId, Priority};
