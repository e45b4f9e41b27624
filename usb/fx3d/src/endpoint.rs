//! Device discovery and the endpoint directory.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::driver_interface::{DeviceHandle, DeviceIdent, UsbBus};
use crate::error::Fx3Error;

pub const ENDP_ATTR_TY_MASK: u8 = 0x3;
pub const ENDP_ADDR_DIR_IN: u8 = 0x80;
pub const ENDP_ADDR_NUM_MASK: u8 = 0x0F;

/// bcdUSB of devices whose endpoints carry a meaningful max burst.
pub const USB_3_0: u16 = 0x0300;

/// SET_INTERFACE, used as the request code when alternate setting selection fails.
pub const SET_INTERFACE: u8 = 0x0B;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpointTy {
    Ctrl,
    Isoch,
    Bulk,
    Interrupt,
}

impl EndpointTy {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDP_ATTR_TY_MASK {
            0 => Self::Ctrl,
            1 => Self::Isoch,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ctrl => "control",
            Self::Isoch => "isochronous",
            Self::Bulk => "bulk",
            Self::Interrupt => "interrupt",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpDirection {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub ty: EndpointTy,
    pub direction: EndpDirection,
    pub max_packet_size: u16,
    pub max_burst: u8,
    /// Alternate setting of interface 0 that exposes this endpoint.
    pub interface: u8,
    pub address: u8,
}

impl EndpointDescriptor {
    pub fn is_isoch(&self) -> bool {
        self.ty == EndpointTy::Isoch
    }
    pub fn is_bulk(&self) -> bool {
        self.ty == EndpointTy::Bulk
    }
}

/// Vendor and product identifiers of the two personalities of the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fx3Ids {
    pub vendor: u16,
    pub stream_product: u16,
    pub boot_product: u16,
}

impl Default for Fx3Ids {
    fn default() -> Self {
        Self {
            vendor: 0x04B4,
            stream_product: 0x00F1,
            boot_product: 0x00F3,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DeviceMode {
    Streaming,
    Bootloader,
    Unrecognized,
}

/// Result of one pass over the bus.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanReport {
    pub loadable: usize,
    pub streamable: usize,
    pub stream: Option<DeviceIdent>,
    pub boot: Option<DeviceIdent>,
}

impl ScanReport {
    pub fn mode(&self) -> DeviceMode {
        if self.streamable > 0 {
            DeviceMode::Streaming
        } else if self.loadable > 0 {
            DeviceMode::Bootloader
        } else {
            DeviceMode::Unrecognized
        }
    }

    pub fn check(&self) -> Result<DeviceMode, Fx3Error> {
        if self.streamable > 1 {
            return Err(Fx3Error::BadDevice(
                "more than one streaming device is attached",
            ));
        }
        match self.mode() {
            DeviceMode::Unrecognized => Err(Fx3Error::BadDevice(
                "no device in streaming or bootloader mode",
            )),
            mode => Ok(mode),
        }
    }
}

pub fn scan<B: UsbBus>(bus: &B, ids: &Fx3Ids) -> Result<ScanReport, Fx3Error> {
    let devices = bus.list().map_err(Fx3Error::UsbInitFailed)?;

    let mut report = ScanReport::default();
    for ident in devices {
        if ident.vendor != ids.vendor {
            continue;
        }
        if ident.product == ids.stream_product {
            info!("Device {}: streaming", ident);
            report.streamable += 1;
            report.stream.get_or_insert(ident);
        } else if ident.product == ids.boot_product {
            info!("Device {}: bootloader", ident);
            report.loadable += 1;
            report.boot.get_or_insert(ident);
        } else {
            debug!("Ignoring device {}", ident);
        }
    }
    Ok(report)
}

pub fn discover<B: UsbBus>(bus: &B, ids: &Fx3Ids) -> Result<DeviceMode, Fx3Error> {
    scan(bus, ids)?.check()
}

/// Walks every alternate setting of interface 0 and collects its data endpoints.
///
/// Leaves the last visited alternate setting active.
pub fn enumerate<H: DeviceHandle>(
    handle: &mut H,
    ids: &Fx3Ids,
) -> Result<SmallVec<[EndpointDescriptor; 4]>, Fx3Error> {
    let ident = handle.ident();
    if ident.vendor != ids.vendor || ident.product != ids.stream_product {
        return Err(Fx3Error::BadDevice("device is not in streaming mode"));
    }

    let alt_settings = handle.alt_setting_count().map_err(Fx3Error::UsbInitFailed)?;

    let mut endpoints = SmallVec::new();
    for alt in 0..alt_settings {
        handle
            .set_alt_setting(alt)
            .map_err(Fx3Error::control(SET_INTERFACE))?;

        let raw_endpoints = handle
            .active_endpoints()
            .map_err(Fx3Error::UsbInitFailed)?;

        for raw in raw_endpoints {
            if raw.address & ENDP_ADDR_NUM_MASK == 0 {
                continue;
            }
            let ty = EndpointTy::from_attributes(raw.attributes);
            if ty == EndpointTy::Ctrl {
                continue;
            }
            let endpoint = EndpointDescriptor {
                ty,
                direction: if raw.address & ENDP_ADDR_DIR_IN != 0 {
                    EndpDirection::In
                } else {
                    EndpDirection::Out
                },
                max_packet_size: raw.max_packet_size,
                max_burst: if ident.usb == USB_3_0 {
                    raw.ss_max_burst
                } else {
                    0
                },
                interface: alt,
                address: raw.address,
            };
            info!(
                "EndPoint[{}] {} {:?} addr={:#04x} max_packet_size={} max_burst={} alt={}",
                endpoints.len(),
                ty.as_str(),
                endpoint.direction,
                endpoint.address,
                endpoint.max_packet_size,
                endpoint.max_burst,
                alt
            );
            endpoints.push(endpoint);
        }
    }
    Ok(endpoints)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver_interface::RawEndpoint;
    use crate::error::ErrorCode;
    use crate::mock::{MockBus, MockDevice};

    #[test]
    fn foreign_device_is_bad_device() {
        let bus = MockBus::new(vec![MockDevice::with_ids(0x1234, 0x5678)]);
        let report = scan(&bus, &Fx3Ids::default()).unwrap();
        assert_eq!(report.loadable, 0);
        assert_eq!(report.streamable, 0);
        assert_eq!(report.mode(), DeviceMode::Unrecognized);
        let err = discover(&bus, &Fx3Ids::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadDevice);
    }

    #[test]
    fn classifies_both_personalities() {
        let ids = Fx3Ids::default();
        let bus = MockBus::new(vec![MockDevice::bootloader(), MockDevice::streaming()]);
        let report = scan(&bus, &ids).unwrap();
        assert_eq!(report.loadable, 1);
        assert_eq!(report.streamable, 1);
        assert_eq!(report.check().unwrap(), DeviceMode::Streaming);

        let bus = MockBus::new(vec![MockDevice::bootloader()]);
        assert_eq!(discover(&bus, &ids).unwrap(), DeviceMode::Bootloader);
    }

    #[test]
    fn two_streaming_devices_are_rejected() {
        let bus = MockBus::new(vec![MockDevice::streaming(), MockDevice::streaming()]);
        let err = discover(&bus, &Fx3Ids::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadDevice);
    }

    #[test]
    fn enumerates_data_endpoints_of_every_alt_setting() {
        let device = MockDevice::streaming();
        device.state().alt_settings = vec![
            vec![
                RawEndpoint {
                    address: 0x00,
                    attributes: 0,
                    max_packet_size: 512,
                    ss_max_burst: 0,
                },
                RawEndpoint {
                    address: 0x81,
                    attributes: 2,
                    max_packet_size: 1024,
                    ss_max_burst: 15,
                },
                RawEndpoint {
                    address: 0x01,
                    attributes: 2,
                    max_packet_size: 1024,
                    ss_max_burst: 0,
                },
            ],
            vec![RawEndpoint {
                address: 0x82,
                attributes: 1,
                max_packet_size: 1024,
                ss_max_burst: 2,
            }],
        ];
        let mut handle = device.clone();

        let endpoints = enumerate(&mut handle, &Fx3Ids::default()).unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].address, 0x81);
        assert_eq!(endpoints[0].direction, EndpDirection::In);
        assert_eq!(endpoints[0].max_burst, 15);
        assert!(endpoints[0].is_bulk());
        assert_eq!(endpoints[1].direction, EndpDirection::Out);
        assert!(endpoints[2].is_isoch());
        assert_eq!(endpoints[2].interface, 1);
        assert_eq!(device.state().alt_history, vec![0, 1]);
    }

    #[test]
    fn max_burst_is_zero_below_usb3() {
        let device = MockDevice::streaming();
        device.state().ident.usb = 0x0210;
        let mut handle = device.clone();
        let endpoints = enumerate(&mut handle, &Fx3Ids::default()).unwrap();
        assert!(endpoints.iter().all(|endpoint| endpoint.max_burst == 0));
    }

    #[test]
    fn bootloader_has_no_endpoint_directory() {
        let mut handle = MockDevice::bootloader();
        let err = enumerate(&mut handle, &Fx3Ids::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadDevice);
    }
}
