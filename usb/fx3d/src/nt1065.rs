//! The NT1065 navigation front-end behind the bridge: power rails, identification and the
//! default register programming.

use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::driver_interface::{ControlTransport, TransportError};
use crate::registers::{render_bits, RegisterAccess};

bitflags! {
    pub struct Rails: u8 {
        const NT1065_EN = 1 << 0;
        const NT1065_AOK = 1 << 1;
        const VCTCXO_EN = 1 << 2;
        const ANT_LNA_EN = 1 << 3;
        const ANT_FEED_EN = 1 << 4;
    }
}

/// Order in which the rails are pulled low.
pub const POWER_DOWN_ORDER: [Rails; 5] = [
    Rails::NT1065_EN,
    Rails::NT1065_AOK,
    Rails::VCTCXO_EN,
    Rails::ANT_LNA_EN,
    Rails::ANT_FEED_EN,
];

/// Order in which the rails are raised again. AOK is an input to the chip and stays low.
pub const POWER_UP_ORDER: [Rails; 4] = [
    Rails::VCTCXO_EN,
    Rails::NT1065_EN,
    Rails::ANT_LNA_EN,
    Rails::ANT_FEED_EN,
];

pub const DEFAULT_RAIL_SETTLE: Duration = Duration::from_millis(500);

/// Status register, read back while programming to check the PLL lock bits.
pub const REG_STATUS: u8 = 0x07;

/// GPIO line numbers of the bridge wired to each rail.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RailLines {
    pub nt1065_en: u16,
    pub nt1065_aok: u16,
    pub vctcxo_en: u16,
    pub ant_lna_en: u16,
    pub ant_feed_en: u16,
}

impl Default for RailLines {
    fn default() -> Self {
        Self {
            nt1065_en: 17,
            nt1065_aok: 18,
            vctcxo_en: 19,
            ant_lna_en: 20,
            ant_feed_en: 21,
        }
    }
}

impl RailLines {
    pub fn line(&self, rail: Rails) -> u16 {
        if rail == Rails::NT1065_EN {
            self.nt1065_en
        } else if rail == Rails::NT1065_AOK {
            self.nt1065_aok
        } else if rail == Rails::VCTCXO_EN {
            self.vctcxo_en
        } else if rail == Rails::ANT_LNA_EN {
            self.ant_lna_en
        } else {
            self.ant_feed_en
        }
    }
}

/// Cycles the front-end supply rails. Returns the rails left enabled.
pub fn power_up<C: ControlTransport + ?Sized>(
    ctl: &C,
    lines: &RailLines,
    settle: Duration,
) -> Result<Rails, TransportError> {
    for rail in POWER_DOWN_ORDER.iter() {
        ctl.write_gpio(lines.line(*rail), 0)?;
    }
    thread::sleep(settle);

    let mut enabled = Rails::empty();
    for rail in POWER_UP_ORDER.iter() {
        ctl.write_gpio(lines.line(*rail), 1)?;
        enabled |= *rail;
    }
    thread::sleep(settle);

    debug!("front-end rails enabled: {:?}", enabled);
    Ok(enabled)
}

pub fn chip_id<C: ControlTransport + ?Sized>(ctl: &C) -> Result<u32, TransportError> {
    let reg0 = u32::from(ctl.read_register16(0x00)?);
    let reg1 = u32::from(ctl.read_register16(0x01)?);
    let id = reg0 << 21 | (reg1 & 0xF8) << 13 | reg1 & 0x07;
    info!("NT1065 chip id: {:08X}", id);
    Ok(id)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegOp {
    Write { address: u8, value: u8 },
    /// Read-modify-write: `(old & keep) | set`.
    Modify { address: u8, keep: u8, set: u8 },
    /// Logs the register for the operator.
    Inspect { address: u8 },
}

const fn w(address: u8, value: u8) -> RegOp {
    RegOp::Write { address, value }
}

/// Single LO, PLL tune, upper sideband on channels 1-3, analog then ADC output with manual gain
/// control, LPF calibration start.
pub const DEFAULT_SEQUENCE: &[RegOp] = &[
    w(3, 0x00),
    w(45, 0x00),
    RegOp::Modify { address: 43, keep: 0xFF, set: 0x01 },
    RegOp::Inspect { address: REG_STATUS },
    RegOp::Modify { address: 20, keep: 0xFD, set: 0x02 },
    RegOp::Modify { address: 27, keep: 0xFD, set: 0x02 },
    RegOp::Modify { address: 34, keep: 0xFD, set: 0x02 },
    RegOp::Inspect { address: REG_STATUS },
    w(15, 0x22),
    w(22, 0x22),
    w(29, 0x22),
    w(36, 0x22),
    w(4, 0x01),
    w(15, 0x23),
    w(19, 0x0B),
    w(22, 0x23),
    w(26, 0x0B),
    w(29, 0x23),
    w(33, 0x0B),
    w(36, 0x23),
    w(40, 0x0B),
];

pub fn apply_sequence<C: ControlTransport + ?Sized>(
    ctl: &C,
    ops: &[RegOp],
) -> Result<(), TransportError> {
    for op in ops {
        match *op {
            RegOp::Write { address, value } => ctl.write_register16(value, address)?,
            RegOp::Modify { address, keep, set } => {
                let old = ctl.read_register16(address)?;
                ctl.write_register16((old & keep) | set, address)?;
            }
            RegOp::Inspect { address } => {
                let value = ctl.read_register16(address)?;
                info!("Reg{} ({:#04x}) = {:#04x} {}", address, address, value, render_bits(value));
            }
        }
    }
    Ok(())
}
