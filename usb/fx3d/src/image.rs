//! FX3 boot images and their download into a device sitting in the bootloader.
//!
//! An image starts with the `"CY"` signature, a control byte and the image type (0xB0 for a
//! plain executable). Sections follow, each a little-endian 32-bit length in words, a 32-bit
//! load address and the data itself. A section with zero length carries the entry point in its
//! address field and is followed by the checksum, the wrapping sum of every data word.

use log::{debug, info};
use thiserror::Error;

use crate::driver_interface::{ControlTransport, DeviceReqData, TransportError};

pub const SIGNATURE: [u8; 2] = *b"CY";
pub const IMAGE_TYPE_NORMAL: u8 = 0xB0;
pub const MAX_IMAGE_LEN: usize = 512 * 1024;

/// Bootloader request used both to write RAM and to jump to the entry point.
pub const FW_DOWNLOAD: u8 = 0xA0;
pub const DOWNLOAD_CHUNK: usize = 4096;
/// Read of the bootloader's identification area, answered only while it runs.
pub const BOOTLOADER_PROBE_INDEX: u16 = 0x4000;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("file is too short to be an FX3 image")]
    InvalidFile,

    #[error("missing CY signature")]
    InvalidSignature,

    #[error("unsupported image type {0:#04x}")]
    UnsupportedImageType(u8),

    #[error("section at offset {offset} runs past the end of the file")]
    IncorrectLength { offset: usize },

    #[error("checksum mismatch (computed {computed:#010x}, stored {stored:#010x})")]
    ChecksumMismatch { computed: u32, stored: u32 },

    #[error("image exceeds 512 KiB")]
    TooLarge,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Section {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwareImage {
    pub sections: Vec<Section>,
    pub entry: u32,
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ImageError> {
    bytes
        .get(offset..offset + 4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .ok_or(ImageError::IncorrectLength { offset })
}

impl FirmwareImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() > MAX_IMAGE_LEN {
            return Err(ImageError::TooLarge);
        }
        if bytes.len() < 4 {
            return Err(ImageError::InvalidFile);
        }
        if bytes[..2] != SIGNATURE {
            return Err(ImageError::InvalidSignature);
        }
        if bytes[3] != IMAGE_TYPE_NORMAL {
            return Err(ImageError::UnsupportedImageType(bytes[3]));
        }

        let mut sections = Vec::new();
        let mut checksum = 0u32;
        let mut offset = 4;
        loop {
            let words = read_u32(bytes, offset)? as usize;
            let address = read_u32(bytes, offset + 4)?;
            offset += 8;

            if words == 0 {
                let stored = read_u32(bytes, offset)?;
                if stored != checksum {
                    return Err(ImageError::ChecksumMismatch {
                        computed: checksum,
                        stored,
                    });
                }
                return Ok(Self {
                    sections,
                    entry: address,
                });
            }

            let len = words
                .checked_mul(4)
                .ok_or(ImageError::IncorrectLength { offset })?;
            let data = bytes
                .get(offset..offset + len)
                .ok_or(ImageError::IncorrectLength { offset })?;
            for word in data.chunks_exact(4) {
                checksum =
                    checksum.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            }
            sections.push(Section {
                address,
                data: data.to_vec(),
            });
            offset += len;
        }
    }

    pub fn len(&self) -> usize {
        self.sections.iter().map(|section| section.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Writes every section into device RAM and jumps to the entry point.
    ///
    /// The device drops off the bus on the jump, so the outcome of that last request is ignored.
    pub fn download<C: ControlTransport + ?Sized>(&self, ctl: &C) -> Result<(), TransportError> {
        for section in &self.sections {
            debug!(
                "section at {:#010x}, {} bytes",
                section.address,
                section.data.len()
            );
            let mut address = section.address;
            for chunk in section.data.chunks(DOWNLOAD_CHUNK) {
                let written = ctl.device_request(
                    FW_DOWNLOAD,
                    address as u16,
                    (address >> 16) as u16,
                    DeviceReqData::Out(chunk),
                )?;
                if written != chunk.len() {
                    return Err(TransportError::ShortTransfer(written, chunk.len()));
                }
                address = address.wrapping_add(chunk.len() as u32);
            }
        }

        info!("jumping to entry point {:#010x}", self.entry);
        if let Err(err) = ctl.device_request(
            FW_DOWNLOAD,
            self.entry as u16,
            (self.entry >> 16) as u16,
            DeviceReqData::NoData,
        ) {
            debug!("entry jump: {}", err);
        }
        Ok(())
    }
}

/// Whether the device answers the bootloader identification request.
pub fn bootloader_active<C: ControlTransport + ?Sized>(ctl: &C) -> bool {
    let mut buf = [0u8; 1];
    match ctl.device_request(
        FW_DOWNLOAD,
        0,
        BOOTLOADER_PROBE_INDEX,
        DeviceReqData::In(&mut buf),
    ) {
        Ok(len) => len == buf.len(),
        Err(err) => {
            debug!("bootloader probe failed: {}", err);
            false
        }
    }
}

#[cfg(test)]
pub(crate) fn build_image(sections: &[(u32, Vec<u32>)], entry: u32) -> Vec<u8> {
    let mut out = vec![b'C', b'Y', 0x1C, IMAGE_TYPE_NORMAL];
    let mut checksum = 0u32;
    for (address, words) in sections {
        out.extend_from_slice(&(words.len() as u32).to_le_bytes());
        out.extend_from_slice(&address.to_le_bytes());
        for word in words {
            checksum = checksum.wrapping_add(*word);
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}
