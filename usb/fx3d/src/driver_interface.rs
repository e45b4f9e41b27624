//! The boundary between the FX3 driver and whatever USB host stack carries its requests.
//!
//! The driver never talks to a host stack directly. Control exchanges go through
//! [`ControlTransport`], streaming goes through a [`TransferQueue`] obtained from a
//! [`DeviceHandle`], and devices are found and opened through a [`UsbBus`]. The production
//! implementation lives in [`crate::nusb_backend`].

use std::ops::Deref;
use std::time::Duration;
use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::EndpointDescriptor;

/// Negotiated link speed of an attached device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum LinkSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl LinkSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Full => "full",
            Self::High => "high",
            Self::Super => "super",
            Self::SuperPlus => "super+",
        }
    }
    pub fn is_high(self) -> bool {
        self == Self::High
    }
    pub fn is_super(self) -> bool {
        matches!(self, Self::Super | Self::SuperPlus)
    }
}

impl fmt::Display for LinkSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the bus reports about an attached device before it is opened.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdent {
    pub vendor: u16,
    pub product: u16,
    /// bcdUSB of the device descriptor.
    pub usb: u16,
    pub speed: Option<LinkSpeed>,
    /// Bus-specific location, stable while the device stays attached.
    pub location: String,
}

impl fmt::Display for DeviceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)?;
        if !self.location.is_empty() {
            write!(f, " at {}", self.location)?;
        }
        if let Some(speed) = self.speed {
            write!(f, " ({} speed)", speed)?;
        }
        Ok(())
    }
}

pub enum DeviceReqData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    NoData,
}
impl DeviceReqData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::NoData => 0,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Vendor-type, device-recipient requests on the default control pipe.
pub trait ControlTransport {
    /// Performs one synchronous control exchange and returns the number of data bytes moved.
    fn device_request(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError>;
}

impl<T: ControlTransport + ?Sized> ControlTransport for &T {
    fn device_request(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError> {
        (**self).device_request(request, value, index, data)
    }
}

/// An endpoint of the active alternate setting, as read from the configuration descriptor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawEndpoint {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    /// bMaxBurst of the SuperSpeed companion descriptor, zero when there is none.
    pub ss_max_burst: u8,
}

/// An opened device with interface 0 claimed.
pub trait DeviceHandle: ControlTransport {
    type Queue: TransferQueue + 'static;

    fn ident(&self) -> DeviceIdent;
    fn alt_setting_count(&self) -> Result<u8, TransportError>;
    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError>;
    /// Endpoints of the currently selected alternate setting.
    fn active_endpoints(&self) -> Result<Vec<RawEndpoint>, TransportError>;
    fn open_queue(&mut self, endpoint: &EndpointDescriptor) -> Result<Self::Queue, TransportError>;
}

pub trait UsbBus {
    type Handle: DeviceHandle;

    fn list(&self) -> Result<Vec<DeviceIdent>, TransportError>;
    fn open(&self, ident: &DeviceIdent) -> Result<Self::Handle, TransportError>;
}

/// Status and length of one isochronous packet inside a transfer.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct IsoPacket {
    pub status: u32,
    pub length: u32,
}

/// A finished transfer, handing its buffer back to the submitter.
#[derive(Debug)]
pub struct Completion<B> {
    pub buffer: B,
    pub actual_len: usize,
    pub status: Result<(), TransportError>,
}

/// Asynchronous transfers against one streaming endpoint.
///
/// Buffers are owned by the queue only while a transfer is in flight. Every submitted buffer
/// comes back through exactly one [`Completion`], and completions are handed out in the order the
/// slots were submitted.
pub trait TransferQueue: Send {
    type Buffer: Deref<Target = [u8]> + Send;

    fn allocate(&mut self, len: usize) -> Result<Self::Buffer, TransportError>;
    fn submit(&mut self, slot: usize, buffer: Self::Buffer) -> Result<(), TransportError>;
    /// Waits up to `timeout` for the transfer submitted for `slot`. Isochronous backends fill
    /// `packets` with per-packet results.
    fn await_completion(
        &mut self,
        slot: usize,
        timeout: Duration,
        packets: &mut [IsoPacket],
    ) -> Option<Completion<Self::Buffer>>;
    /// Best-effort cancellation of everything in flight. Cancelled transfers still complete.
    fn abort(&mut self);
    fn pending(&self) -> usize;
}

#[derive(Debug, Error)]
#[error("invalid: {0}")]
pub struct Invalid(pub &'static str);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),

    #[error("usb error: {0}")]
    Usb(String),

    #[error("endpoint stalled")]
    Stalled,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer fault")]
    Fault,

    #[error("device answered with status {0:#x}")]
    DeviceStatus(u32),

    #[error("short transfer ({0} of {1} bytes)")]
    ShortTransfer(usize, usize),

    #[error("invalid response")]
    InvalidResponse(#[from] Invalid),

    #[error("transfer buffer too large ({0} > 65535)")]
    TransferBufTooLarge(usize),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
