//! Vendor control requests understood by the streaming firmware.

use std::mem;

use log::{debug, trace, warn};

use crate::driver_interface::{ControlTransport, DeviceReqData, Invalid, TransportError};

pub mod request {
    pub const CYPRESS_RESET: u8 = 0xB0;
    pub const START: u8 = 0xB2;
    pub const REG_WRITE: u8 = 0xB3;
    pub const DEBUG_INFO: u8 = 0xB4;
    pub const REG24_READ: u8 = 0xB5;
    pub const REG24_WRITE: u8 = 0xB6;
    pub const REG_READ: u8 = 0xB7;
    pub const WRITE_GPIO: u8 = 0xB8;
    pub const READ_GPIO: u8 = 0xB9;
}

/// Every register and GPIO exchange moves exactly this many bytes.
pub const PAYLOAD_LEN: usize = 16;
pub const DEBUG_INFO_LEN: usize = 32;

pub const REG_READ_FLAG: u16 = 0x0080;
pub const REG24_READ_FLAG: u16 = 0x8000;
pub const REG_ADDR_MASK: u8 = 0x7F;
pub const REG24_ADDR_MASK: u16 = 0x7FFF;

/// Value written into `wIndex` by write requests.
const WRITE_INDEX: u16 = 1;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GpioAnswer {
    /// Zero on success.
    pub status: u32,
    pub value: u32,
    pub _rsvd: [u32; 2],
}
unsafe impl plain::Plain for GpioAnswer {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DebugInfoBlock {
    pub transfers: u32,
    pub overflows: u32,
    pub phy_err_inc: u32,
    pub lnk_err_inc: u32,
    pub err_reg: u32,
    pub phy_errs: u32,
    pub lnk_errs: u32,
    pub _rsvd: u32,
}
unsafe impl plain::Plain for DebugInfoBlock {}

impl DebugInfoBlock {
    /// Fields arrive little-endian on the wire.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, TransportError> {
        let raw = plain::from_bytes::<Self>(bytes)
            .map_err(|_| TransportError::ShortTransfer(bytes.len(), mem::size_of::<Self>()))?;
        Ok(Self {
            transfers: u32::from_le(raw.transfers),
            overflows: u32::from_le(raw.overflows),
            phy_err_inc: u32::from_le(raw.phy_err_inc),
            lnk_err_inc: u32::from_le(raw.lnk_err_inc),
            err_reg: u32::from_le(raw.err_reg),
            phy_errs: u32::from_le(raw.phy_errs),
            lnk_errs: u32::from_le(raw.lnk_errs),
            _rsvd: 0,
        })
    }
}

fn expect_len(got: usize, expected: usize) -> Result<(), TransportError> {
    if got < expected {
        Err(TransportError::ShortTransfer(got, expected))
    } else {
        Ok(())
    }
}

/// Register, GPIO and maintenance requests. Each call is exactly one control exchange and is
/// never retried.
pub trait RegisterAccess: ControlTransport {
    fn write_register16(&self, value: u8, address: u8) -> Result<(), TransportError> {
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0] = value;
        buf[1] = address & REG_ADDR_MASK;
        trace!("REG[{:#04x}] <- {:#04x}", buf[1], value);
        self.device_request(request::REG_WRITE, 0, WRITE_INDEX, DeviceReqData::Out(&buf))?;
        Ok(())
    }

    fn read_register16(&self, address: u8) -> Result<u8, TransportError> {
        let mut buf = [0u8; PAYLOAD_LEN];
        let index = u16::from(address & REG_ADDR_MASK) | REG_READ_FLAG;
        let len = self.device_request(request::REG_READ, 0, index, DeviceReqData::In(&mut buf))?;
        expect_len(len, 1)?;
        trace!("REG[{:#04x}] -> {:#04x}", address, buf[0]);
        Ok(buf[0])
    }

    fn write_register24(&self, value: u8, address: u16) -> Result<(), TransportError> {
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0] = value;
        buf[1..3].copy_from_slice(&(address & REG24_ADDR_MASK).to_le_bytes());
        trace!("REG24[{:#06x}] <- {:#04x}", address, value);
        self.device_request(request::REG24_WRITE, 0, WRITE_INDEX, DeviceReqData::Out(&buf))?;
        Ok(())
    }

    fn read_register24(&self, address: u16) -> Result<u8, TransportError> {
        let mut buf = [0u8; PAYLOAD_LEN];
        let index = (address & REG24_ADDR_MASK) | REG24_READ_FLAG;
        let len = self.device_request(request::REG24_READ, 0, index, DeviceReqData::In(&mut buf))?;
        expect_len(len, 1)?;
        trace!("REG24[{:#06x}] -> {:#04x}", address, buf[0]);
        Ok(buf[0])
    }

    fn write_gpio(&self, line: u16, value: u16) -> Result<(), TransportError> {
        let answer = gpio_exchange(self, request::WRITE_GPIO, line, value)?;
        debug!("GPIO[{}] <- {} (now {})", line, value, { answer.value });
        Ok(())
    }

    fn read_gpio(&self, line: u16) -> Result<u32, TransportError> {
        let answer = gpio_exchange(self, request::READ_GPIO, line, 0)?;
        let value = answer.value;
        debug!("GPIO[{}] -> {}", line, value);
        Ok(value)
    }

    fn reset_device(&self) -> Result<(), TransportError> {
        debug!("resetting device");
        let buf = [0u8; PAYLOAD_LEN];
        self.device_request(request::CYPRESS_RESET, 0, 0, DeviceReqData::Out(&buf))?;
        Ok(())
    }

    /// Tells the firmware to begin pushing samples to the streaming endpoint.
    fn start_streaming(&self) -> Result<(), TransportError> {
        let mut buf = [0u8; PAYLOAD_LEN];
        self.device_request(request::START, 0, 0, DeviceReqData::In(&mut buf))?;
        Ok(())
    }

    fn read_debug_info(&self) -> Result<DebugInfoBlock, TransportError> {
        let mut buf = [0u8; DEBUG_INFO_LEN];
        let len = self.device_request(request::DEBUG_INFO, 0, 1, DeviceReqData::In(&mut buf))?;
        expect_len(len, DEBUG_INFO_LEN)?;
        DebugInfoBlock::from_wire(&buf)
    }

    /// Reads a register over the 24-bit path, returning 0xFF when the exchange fails.
    fn peek8(&self, address: u16) -> u8 {
        match self.read_register24(address) {
            Ok(value) => value,
            Err(err) => {
                warn!("peek {:#06x} failed: {}", address, err);
                0xFF
            }
        }
    }

    fn poke8(&self, address: u16, value: u8) -> Result<(), TransportError> {
        self.write_register24(value, address)
    }

    /// Debug aid: reads a 16-bit-path register and renders its bits.
    fn dump_register(&self, address: u8) -> Result<String, TransportError> {
        let value = self.read_register16(address)?;
        let rendered = format!(
            "REG[{:#04x}] = {:#04x} {}",
            address & REG_ADDR_MASK,
            value,
            render_bits(value)
        );
        debug!("{}", rendered);
        Ok(rendered)
    }
}

impl<T: ControlTransport + ?Sized> RegisterAccess for T {}

fn gpio_exchange<T: ControlTransport + ?Sized>(
    ctl: &T,
    request: u8,
    line: u16,
    value: u16,
) -> Result<GpioAnswer, TransportError> {
    let mut buf = [0u8; PAYLOAD_LEN];
    let len = ctl.device_request(request, value, line, DeviceReqData::In(&mut buf))?;
    expect_len(len, 8)?;

    let raw = plain::from_bytes::<GpioAnswer>(&buf)
        .map_err(|_| Invalid("gpio answer does not fit the payload"))?;
    let answer = GpioAnswer {
        status: u32::from_le(raw.status),
        value: u32::from_le(raw.value),
        _rsvd: [0; 2],
    };
    if answer.status != 0 {
        return Err(TransportError::DeviceStatus(answer.status));
    }
    Ok(answer)
}

/// Renders the bits of a register, most significant first, grouped by nibble.
pub fn render_bits(value: u8) -> String {
    let mut out = String::with_capacity(9);
    for bit in (0..8).rev() {
        out.push(if value & (1 << bit) != 0 { '1' } else { '0' });
        if bit == 4 {
            out.push('_');
        }
    }
    out
}
