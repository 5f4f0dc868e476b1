use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("TNC task channel closed")]
    ChannelClosed,
}
