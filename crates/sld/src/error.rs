use std::path::PathBuf;

use sld_elf::ElfError;
use sld_map::MapError;
use thiserror::Error;

use crate::loader::LoadStage;
use crate::transfer::TransferError;

/// Loader errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot determine size of {}: {source}", path.display())]
    FileSize {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot map {}: {source}", path.display())]
    MapFile { path: PathBuf, source: MapError },
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ElfError),
    #[error("cannot place image: {0}")]
    Plan(MapError),
    #[error("failed to map segment: {0}")]
    Mapping(MapError),
    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),
    #[error("control returned to the loader: {0}")]
    TransferReturned(#[from] TransferError),
}

impl Error {
    /// Last stage the load reached before failing.
    #[must_use]
    pub const fn stage(&self) -> LoadStage {
        match self {
            Self::Open { .. } => LoadStage::Start,
            Self::FileSize { .. } => LoadStage::Opened,
            Self::MapFile { .. } => LoadStage::SizeKnown,
            Self::InvalidImage(_) => LoadStage::MetadataMapped,
            Self::Plan(_) | Self::Mapping(_) | Self::Report(_) => LoadStage::HeaderRead,
            Self::TransferReturned(_) => LoadStage::MetadataUnmapped,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
