//! Host backend over `nusb`.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, warn};
use nusb::transfer::{
    Buffer, Bulk, Completion as NusbCompletion, ControlIn, ControlOut, ControlType, In,
    Interrupt, Recipient, TransferError,
};
use nusb::{Device, DeviceInfo, Endpoint, Interface, MaybeFuture, Speed};

use crate::driver_interface::{
    Completion, ControlTransport, DeviceHandle, DeviceIdent, DeviceReqData, IsoPacket, LinkSpeed,
    RawEndpoint, TransferQueue, TransportError, UsbBus,
};
use crate::endpoint::{EndpDirection, EndpointDescriptor, EndpointTy};

const DESC_INTERFACE: u8 = 0x04;
const DESC_ENDPOINT: u8 = 0x05;
const DESC_SS_ENDPOINT_COMPANION: u8 = 0x30;

fn transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Cancelled => TransportError::Cancelled,
        TransferError::Stall => TransportError::Stalled,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Fault => TransportError::Fault,
        other => TransportError::Usb(other.to_string()),
    }
}

fn usb_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Usb(err.to_string())
}

fn link_speed(speed: Speed) -> Option<LinkSpeed> {
    match speed {
        Speed::Low => Some(LinkSpeed::Low),
        Speed::Full => Some(LinkSpeed::Full),
        Speed::High => Some(LinkSpeed::High),
        Speed::Super => Some(LinkSpeed::Super),
        Speed::SuperPlus => Some(LinkSpeed::SuperPlus),
        _ => None,
    }
}

fn location(info: &DeviceInfo) -> String {
    format!("{}-{}", info.bus_id(), info.device_address())
}

fn ident_of(info: &DeviceInfo) -> DeviceIdent {
    DeviceIdent {
        vendor: info.vendor_id(),
        product: info.product_id(),
        usb: info.usb_version(),
        speed: info.speed().and_then(link_speed),
        location: location(info),
    }
}

pub struct NusbBus {
    control_timeout: Duration,
}

impl NusbBus {
    pub fn new(control_timeout: Duration) -> Self {
        Self { control_timeout }
    }
}

impl UsbBus for NusbBus {
    type Handle = NusbHandle;

    fn list(&self) -> Result<Vec<DeviceIdent>, TransportError> {
        let devices = nusb::list_devices().wait().map_err(usb_error)?;
        Ok(devices.map(|info| ident_of(&info)).collect())
    }

    fn open(&self, ident: &DeviceIdent) -> Result<NusbHandle, TransportError> {
        let info = nusb::list_devices()
            .wait()
            .map_err(usb_error)?
            .find(|info| location(info) == ident.location)
            .ok_or(TransportError::Disconnected)?;
        let device = info.open().wait().map_err(usb_error)?;

        // The bootloader only answers control requests; there is nothing to claim there.
        let interface = match device.claim_interface(0).wait() {
            Ok(interface) => Some(interface),
            Err(err) => {
                debug!("{}: interface 0 not claimed: {}", ident, err);
                None
            }
        };

        Ok(NusbHandle {
            device,
            interface,
            ident: ident_of(&info),
            alt: 0,
            timeout: self.control_timeout,
        })
    }
}

pub struct NusbHandle {
    device: Device,
    interface: Option<Interface>,
    ident: DeviceIdent,
    alt: u8,
    timeout: Duration,
}

impl NusbHandle {
    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or(TransportError::Unsupported("interface 0 is not claimed"))
    }

    /// Walks the raw configuration descriptor, collecting the endpoints of every alternate
    /// setting of interface 0 along with their SuperSpeed companion burst.
    fn interface0_endpoints(&self) -> Result<Vec<(u8, RawEndpoint)>, TransportError> {
        let config = self.device.active_configuration().map_err(usb_error)?;

        let mut endpoints: Vec<(u8, RawEndpoint)> = Vec::new();
        let mut current: Option<u8> = None;
        let mut alts = 0u8;
        for desc in config.descriptors() {
            let bytes: &[u8] = &desc;
            if bytes.len() < 2 {
                continue;
            }
            match bytes[1] {
                DESC_INTERFACE if bytes.len() >= 4 => {
                    current = if bytes[2] == 0 {
                        alts = alts.max(bytes[3].saturating_add(1));
                        Some(bytes[3])
                    } else {
                        None
                    };
                }
                DESC_ENDPOINT if bytes.len() >= 6 => {
                    if let Some(alt) = current {
                        endpoints.push((
                            alt,
                            RawEndpoint {
                                address: bytes[2],
                                attributes: bytes[3],
                                max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]) & 0x7FF,
                                ss_max_burst: 0,
                            },
                        ));
                    }
                }
                DESC_SS_ENDPOINT_COMPANION if bytes.len() >= 3 => {
                    if let (Some(_), Some((_, last))) = (current, endpoints.last_mut()) {
                        last.ss_max_burst = bytes[2];
                    }
                }
                _ => (),
            }
        }
        if alts == 0 {
            return Err(TransportError::Unsupported("device has no interface 0"));
        }
        Ok(endpoints)
    }
}

impl ControlTransport for NusbHandle {
    fn device_request(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError> {
        match data {
            DeviceReqData::In(buf) => {
                let length = u16::try_from(buf.len())
                    .map_err(|_| TransportError::TransferBufTooLarge(buf.len()))?;
                let answer = self
                    .device
                    .control_in(
                        ControlIn {
                            control_type: ControlType::Vendor,
                            recipient: Recipient::Device,
                            request,
                            value,
                            index,
                            length,
                        },
                        self.timeout,
                    )
                    .wait()
                    .map_err(transfer_error)?;
                let len = answer.len().min(buf.len());
                buf[..len].copy_from_slice(&answer[..len]);
                Ok(len)
            }
            DeviceReqData::Out(buf) => {
                if buf.len() > usize::from(u16::MAX) {
                    return Err(TransportError::TransferBufTooLarge(buf.len()));
                }
                self.device
                    .control_out(
                        ControlOut {
                            control_type: ControlType::Vendor,
                            recipient: Recipient::Device,
                            request,
                            value,
                            index,
                            data: buf,
                        },
                        self.timeout,
                    )
                    .wait()
                    .map_err(transfer_error)?;
                Ok(buf.len())
            }
            DeviceReqData::NoData => {
                self.device
                    .control_out(
                        ControlOut {
                            control_type: ControlType::Vendor,
                            recipient: Recipient::Device,
                            request,
                            value,
                            index,
                            data: &[],
                        },
                        self.timeout,
                    )
                    .wait()
                    .map_err(transfer_error)?;
                Ok(0)
            }
        }
    }
}

impl DeviceHandle for NusbHandle {
    type Queue = NusbQueue;

    fn ident(&self) -> DeviceIdent {
        self.ident.clone()
    }

    fn alt_setting_count(&self) -> Result<u8, TransportError> {
        let config = self.device.active_configuration().map_err(usb_error)?;
        let mut alts = 0u8;
        for desc in config.descriptors() {
            let bytes: &[u8] = &desc;
            if bytes.len() >= 4 && bytes[1] == DESC_INTERFACE && bytes[2] == 0 {
                alts = alts.max(bytes[3].saturating_add(1));
            }
        }
        Ok(alts)
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError> {
        self.interface()?
            .set_alt_setting(alt)
            .wait()
            .map_err(usb_error)?;
        self.alt = alt;
        Ok(())
    }

    fn active_endpoints(&self) -> Result<Vec<RawEndpoint>, TransportError> {
        Ok(self
            .interface0_endpoints()?
            .into_iter()
            .filter(|(alt, _)| *alt == self.alt)
            .map(|(_, endpoint)| endpoint)
            .collect())
    }

    fn open_queue(&mut self, endpoint: &EndpointDescriptor) -> Result<NusbQueue, TransportError> {
        if endpoint.direction != EndpDirection::In {
            return Err(TransportError::Unsupported("streaming needs an IN endpoint"));
        }
        let interface = self.interface()?;
        let inner = match endpoint.ty {
            EndpointTy::Bulk => {
                NusbEndpoint::Bulk(interface.endpoint::<Bulk, In>(endpoint.address).map_err(usb_error)?)
            }
            EndpointTy::Interrupt => NusbEndpoint::Interrupt(
                interface
                    .endpoint::<Interrupt, In>(endpoint.address)
                    .map_err(usb_error)?,
            ),
            EndpointTy::Isoch => {
                return Err(TransportError::Unsupported(
                    "isochronous transfers are not available on this host backend",
                ))
            }
            EndpointTy::Ctrl => {
                return Err(TransportError::Unsupported("cannot stream from a control endpoint"))
            }
        };
        Ok(NusbQueue {
            inner,
            order: VecDeque::new(),
        })
    }
}

enum NusbEndpoint {
    Bulk(Endpoint<Bulk, In>),
    Interrupt(Endpoint<Interrupt, In>),
}

impl NusbEndpoint {
    fn allocate(&mut self, len: usize) -> Buffer {
        match self {
            Self::Bulk(ep) => ep.allocate(len),
            Self::Interrupt(ep) => ep.allocate(len),
        }
    }
    fn submit(&mut self, buffer: Buffer) {
        match self {
            Self::Bulk(ep) => ep.submit(buffer),
            Self::Interrupt(ep) => ep.submit(buffer),
        }
    }
    fn wait_next_complete(&mut self, timeout: Duration) -> Option<NusbCompletion> {
        match self {
            Self::Bulk(ep) => ep.wait_next_complete(timeout),
            Self::Interrupt(ep) => ep.wait_next_complete(timeout),
        }
    }
    fn cancel_all(&mut self) {
        match self {
            Self::Bulk(ep) => ep.cancel_all(),
            Self::Interrupt(ep) => ep.cancel_all(),
        }
    }
    fn pending(&self) -> usize {
        match self {
            Self::Bulk(ep) => ep.pending(),
            Self::Interrupt(ep) => ep.pending(),
        }
    }
}

/// Transfers on one endpoint complete in submission order, so slots are matched to
/// completions by keeping that order.
pub struct NusbQueue {
    inner: NusbEndpoint,
    order: VecDeque<usize>,
}

impl TransferQueue for NusbQueue {
    type Buffer = Buffer;

    fn allocate(&mut self, len: usize) -> Result<Buffer, TransportError> {
        let mut buffer = self.inner.allocate(len);
        buffer.set_requested_len(len);
        Ok(buffer)
    }

    fn submit(&mut self, slot: usize, mut buffer: Buffer) -> Result<(), TransportError> {
        let len = buffer.capacity();
        buffer.clear();
        buffer.set_requested_len(len);
        self.inner.submit(buffer);
        self.order.push_back(slot);
        Ok(())
    }

    fn await_completion(
        &mut self,
        slot: usize,
        timeout: Duration,
        _packets: &mut [IsoPacket],
    ) -> Option<Completion<Buffer>> {
        if self.order.front() != Some(&slot) {
            warn!(
                "slot {} awaited out of order (next due is {:?})",
                slot,
                self.order.front()
            );
            return None;
        }
        let completion = self.inner.wait_next_complete(timeout)?;
        self.order.pop_front();
        Some(Completion {
            actual_len: completion.actual_len,
            status: completion.status.map_err(transfer_error),
            buffer: completion.buffer,
        })
    }

    fn abort(&mut self) {
        self.inner.cancel_all();
    }

    fn pending(&self) -> usize {
        self.inner.pending()
    }
}

impl Drop for NusbQueue {
    fn drop(&mut self) {
        if self.inner.pending() > 0 {
            self.inner.cancel_all();
            while self.inner.pending() > 0 {
                if self.inner.wait_next_complete(Duration::from_millis(100)).is_none() {
                    break;
                }
            }
        }
    }
}
