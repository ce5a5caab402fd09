//! .oi image files
//!
//! An image is a fixed 40-byte little-endian header followed by the code and
//! initialized-data bytes. The header's flags field selects the image width;
//! the remaining fields size the RAM regions laid out from address 0: code,
//! initialized data, zero-filled data, free heap, and a stack growing down
//! from the top of RAM.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::memory::ImageWidth;

pub const HEADER_LEN: usize = 40;
pub const SIGNATURE: [u8; 2] = *b"OI";
pub const VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image file is shorter than the {HEADER_LEN}-byte header")]
    TooShort,
    #[error("image signature isn't the expected OI")]
    BadSignature,
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u8),
    #[error("image width in header is malformed (flags {0:#04x})")]
    MalformedWidth(u8),
    #[error("image file ends before code and data sections ({missing} bytes missing)")]
    TruncatedPayload { missing: usize },
    #[error("insufficient RAM for this application. required {required}, available {available}")]
    InsufficientRam { required: u64, available: u64 },
    #[error("image file I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for ImageError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// The parsed 40-byte image header
#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub version: u8,
    pub flags: u8,
    pub image_width: ImageWidth,
    pub cb_code: u32,
    pub cb_initialized_data: u32,
    pub cb_zero_filled_data: u32,
    pub cb_stack: u32,
    ram_required: u64,
    initial_pc: u64,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4 bytes"))
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN {
            return Err(ImageError::TooShort);
        }
        if bytes[0..2] != SIGNATURE {
            return Err(ImageError::BadSignature);
        }
        let version = bytes[2];
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let flags = bytes[3];
        let image_width = ImageWidth::from_flags(flags)
            .ok_or(ImageError::MalformedWidth(flags))?;

        let lo_ram_required = read_u32(bytes, 24);
        let hi_ram_required = read_u32(bytes, 28);
        let lo_initial_pc = read_u32(bytes, 32);
        let hi_initial_pc = read_u32(bytes, 36);

        Ok(Self {
            version,
            flags,
            image_width,
            cb_code: read_u32(bytes, 8),
            cb_initialized_data: read_u32(bytes, 12),
            cb_zero_filled_data: read_u32(bytes, 16),
            cb_stack: read_u32(bytes, 20),
            ram_required: combine(lo_ram_required, hi_ram_required),
            initial_pc: combine(lo_initial_pc, hi_initial_pc),
        })
    }

    /// RAM the image needs for code, data and stack (args/env come on top)
    pub fn ram_required(&self) -> u64 {
        self.ram_required
    }

    pub fn initial_pc(&self) -> u64 {
        self.initial_pc
    }
}

/// Combine the lo/hi halves of a 64-bit header field. The hi half is only
/// written by 8-byte-width images and is zero otherwise.
fn combine(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "  signature:                OI")?;
        writeln!(f, "  version:                  {}", self.version)?;
        writeln!(f, "  flags:                    {:04x}h", self.flags)?;
        writeln!(f, "  image width:              {}", self.image_width.width())?;
        writeln!(f, "  ram required:             {}", self.ram_required)?;
        writeln!(f, "  code size:                {}", self.cb_code)?;
        writeln!(f, "  initialized data size:    {}", self.cb_initialized_data)?;
        writeln!(f, "  zero-filled data size:    {}", self.cb_zero_filled_data)?;
        writeln!(f, "  stack size:               {}", self.cb_stack)?;
        writeln!(f, "  initial PC:               {}", self.initial_pc)
    }
}

/// A parsed image: header plus the code and initialized-data bytes that
/// the loader copies to RAM address 0
#[derive(Debug)]
pub struct Image {
    pub header: ImageHeader,
    pub payload: Vec<u8>,
}

impl Image {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let header = ImageHeader::parse(bytes)?;
        let payload_len =
            header.cb_code as usize + header.cb_initialized_data as usize;
        let available = bytes.len() - HEADER_LEN;
        if available < payload_len {
            return Err(ImageError::TruncatedPayload {
                missing: payload_len - available,
            });
        }
        Ok(Self {
            header,
            payload: bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn header_bytes(width_flag: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = b'O';
        bytes[1] = b'I';
        bytes[2] = VERSION;
        bytes[3] = width_flag;
        bytes[8..12].copy_from_slice(&4u32.to_le_bytes()); // cbCode
        bytes[12..16].copy_from_slice(&2u32.to_le_bytes()); // cbInitializedData
        bytes[16..20].copy_from_slice(&8u32.to_le_bytes()); // cbZeroFilledData
        bytes[20..24].copy_from_slice(&64u32.to_le_bytes()); // cbStack
        bytes[24..28].copy_from_slice(&1024u32.to_le_bytes()); // loRamRequired
        bytes[32..36].copy_from_slice(&2u32.to_le_bytes()); // loInitialPC
        bytes
    }

    #[test]
    fn check_parse_valid_header() {
        let header = ImageHeader::parse(&header_bytes(0)).unwrap();
        assert_eq!(header.image_width, ImageWidth::Two);
        assert_eq!(header.cb_code, 4);
        assert_eq!(header.cb_initialized_data, 2);
        assert_eq!(header.ram_required(), 1024);
        assert_eq!(header.initial_pc(), 2);
    }

    #[test]
    fn check_width_flags() {
        for (flag, width) in [(0, 2), (1, 4), (2, 8)] {
            let header = ImageHeader::parse(&header_bytes(flag)).unwrap();
            assert_eq!(header.image_width.width(), width);
        }
        assert!(matches!(
            ImageHeader::parse(&header_bytes(3)),
            Err(ImageError::MalformedWidth(3))
        ));
    }

    #[test]
    fn check_bad_signature_rejected() {
        let mut bytes = header_bytes(0);
        bytes[1] = b'X';
        assert!(matches!(
            ImageHeader::parse(&bytes),
            Err(ImageError::BadSignature)
        ));
    }

    #[test]
    fn check_short_file_rejected() {
        assert!(matches!(
            ImageHeader::parse(&[b'O', b'I']),
            Err(ImageError::TooShort)
        ));
    }

    #[test]
    fn check_hi_half_combines_for_wide_images() {
        let mut bytes = header_bytes(2);
        bytes[28..32].copy_from_slice(&1u32.to_le_bytes()); // hiRamRequired
        let header = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(header.ram_required(), 0x1_0000_0400);
    }

    #[test]
    fn check_payload_extraction() {
        let mut bytes = header_bytes(0);
        bytes.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let image = Image::from_bytes(&bytes).unwrap();
        assert_eq!(image.payload, &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn check_truncated_payload_rejected() {
        let mut bytes = header_bytes(0);
        bytes.extend_from_slice(&[0x00, 0x11]);
        assert!(matches!(
            Image::from_bytes(&bytes),
            Err(ImageError::TruncatedPayload { missing: 4 })
        ));
    }
}
