use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver_interface::TransportError;
use crate::image::ImageError;
use crate::stream::StreamError;

/// Flat status codes, as reported to operators and in telemetry snapshots.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    UsbInitFailed,
    BadDevice,
    FirmwareFileIoError,
    FirmwareCorrupted,
    ControlTransferFailed,
    AdditionalFirmwareFileIoError,
    StreamFailed,
}

impl Default for ErrorCode {
    fn default() -> Self {
        Self::Ok
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UsbInitFailed => "usb init failed",
            Self::BadDevice => "bad device",
            Self::FirmwareFileIoError => "firmware file i/o error",
            Self::FirmwareCorrupted => "firmware corrupted",
            Self::ControlTransferFailed => "control transfer failed",
            Self::AdditionalFirmwareFileIoError => "additional firmware file i/o error",
            Self::StreamFailed => "stream failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum Fx3Error {
    #[error("usb initialization failed: {0}")]
    UsbInitFailed(#[source] TransportError),

    #[error("bad device: {0}")]
    BadDevice(&'static str),

    #[error("cannot read firmware image {}: {source}", .path.display())]
    FirmwareFileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("firmware image rejected: {0}")]
    FirmwareCorrupted(#[from] ImageError),

    #[error("control request {request:#04x} failed: {source}")]
    ControlTransferFailed {
        request: u8,
        #[source]
        source: TransportError,
    },

    #[error("cannot read register script {}: {source}", .path.display())]
    AdditionalFirmwareFileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("streaming failed: {0}")]
    Stream(#[from] StreamError),
}

impl Fx3Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UsbInitFailed(_) => ErrorCode::UsbInitFailed,
            Self::BadDevice(_) => ErrorCode::BadDevice,
            Self::FirmwareFileIo { .. } => ErrorCode::FirmwareFileIoError,
            Self::FirmwareCorrupted(_) => ErrorCode::FirmwareCorrupted,
            Self::ControlTransferFailed { .. } => ErrorCode::ControlTransferFailed,
            Self::AdditionalFirmwareFileIo { .. } => ErrorCode::AdditionalFirmwareFileIoError,
            Self::Stream(_) => ErrorCode::StreamFailed,
        }
    }

    pub(crate) fn control(request: u8) -> impl FnOnce(TransportError) -> Self {
        move |source| Self::ControlTransferFailed { request, source }
    }
}

/// How a bring-up attempt ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FirmwareLoadOutcome {
    Ok,
    FileNotFound,
    CorruptedImage,
    BadDevice,
    ControlTransferFailure,
}

impl FirmwareLoadOutcome {
    pub fn from_result<T>(result: &Result<T, Fx3Error>) -> Self {
        let err = match result {
            Ok(_) => return Self::Ok,
            Err(err) => err,
        };
        match err {
            Fx3Error::FirmwareFileIo { .. } | Fx3Error::AdditionalFirmwareFileIo { .. } => {
                Self::FileNotFound
            }
            Fx3Error::FirmwareCorrupted(_) => Self::CorruptedImage,
            Fx3Error::BadDevice(_) | Fx3Error::UsbInitFailed(_) => Self::BadDevice,
            Fx3Error::ControlTransferFailed { .. } | Fx3Error::Stream(_) => {
                Self::ControlTransferFailure
            }
        }
    }
}
