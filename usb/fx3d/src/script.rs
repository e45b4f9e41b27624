//! Register scripts: lists of (address, value) pairs written through the 16-bit register path.
//!
//! One pair per line, both in hexadecimal with an optional `0x` prefix, separated by whitespace,
//! a comma or `=`. Text after `#`, `;` or `//` is ignored, as are blank lines.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use thiserror::Error;

use crate::driver_interface::{ControlTransport, TransportError};
use crate::registers::RegisterAccess;

/// Name that selects the built-in front-end sequence instead of a file.
pub const BUILTIN_NAME: &str = "manual";
pub const DEFAULT_STOP_ADDRESS: u8 = 48;
pub const DEFAULT_WRITE_DELAY: Duration = Duration::from_millis(20);

lazy_static! {
    static ref PAIR: Regex = Regex::new(
        r"^(?:0[xX])?([0-9A-Fa-f]{1,2})\s*[,=\s]\s*(?:0[xX])?([0-9A-Fa-f]{1,2})$"
    )
    .expect("register pair pattern is valid");
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterWrite {
    pub address: u8,
    pub value: u8,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: cannot parse {text:?} as an address/value pair")]
    Malformed { line: usize, text: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegisterScript {
    Builtin,
    File(PathBuf),
}

impl RegisterScript {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" => None,
            BUILTIN_NAME => Some(Self::Builtin),
            path => Some(Self::File(PathBuf::from(path))),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    let end = ["#", ";", "//"]
        .iter()
        .filter_map(|marker| line.find(marker))
        .min()
        .unwrap_or(line.len());
    line[..end].trim()
}

pub fn parse(text: &str) -> Result<Vec<RegisterWrite>, ScriptError> {
    let mut writes = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        let malformed = || ScriptError::Malformed {
            line: i + 1,
            text: raw.to_string(),
        };
        let caps = PAIR.captures(line).ok_or_else(malformed)?;
        let address = u8::from_str_radix(&caps[1], 16).map_err(|_| malformed())?;
        let value = u8::from_str_radix(&caps[2], 16).map_err(|_| malformed())?;
        writes.push(RegisterWrite { address, value });
    }
    Ok(writes)
}

/// Writes `writes` in order with `delay` after each one, stopping once `stop` has been written.
///
/// Returns the number of writes performed. The first failing write ends the sequence.
pub fn apply_writes<C: ControlTransport + ?Sized>(
    ctl: &C,
    writes: &[RegisterWrite],
    stop: Option<u8>,
    delay: Duration,
) -> Result<usize, TransportError> {
    let mut done = 0;
    for write in writes {
        ctl.write_register16(write.value, write.address)?;
        done += 1;
        thread::sleep(delay);

        if Some(write.address) == stop {
            debug!("reached stop address {}", write.address);
            break;
        }
    }
    info!("register script: {} of {} writes applied", done, writes.len());
    Ok(done)
}
