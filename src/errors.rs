use thiserror::Error;

use crate::channel::{ChannelError, RevocationError};
use crate::contractcourt::ContractError;
use crate::invoice::InvoiceError;
use crate::store::StoreError;
use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("revocation error: {0}")]
    Revocation(#[from] RevocationError),
    #[error("invoice error: {0}")]
    Invoice(#[from] InvoiceError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

pub type Result<T> = std::result::Result<T, Error>;
