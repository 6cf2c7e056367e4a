// SPDX-License-Identifier: GPL-3.0-only
//! Minimal EDID base block parser
//!
//! Only the identity fields are decoded: manufacturer, product code, serial,
//! manufacture date, physical size and the monitor name/serial descriptors.
//! These feed display identity matching and the connector UUID patterns.

use anyhow::{Result, bail};

const EDID_HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
const BASE_BLOCK_LEN: usize = 128;
const DESCRIPTOR_OFFSETS: [usize; 4] = [54, 72, 90, 108];
const DESCRIPTOR_NAME: u8 = 0xFC;
const DESCRIPTOR_SERIAL: u8 = 0xFF;

/// Identity fields decoded from an EDID base block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdidInfo {
    /// Raw packed manufacturer id (bytes 8-9, big-endian)
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: u32,
    pub week: u8,
    pub year: u16,
    /// Physical size in centimetres
    pub width_cm: u8,
    pub height_cm: u8,
    pub name: Option<String>,
    pub serial_text: Option<String>,
    raw_header: [u8; 16],
}

impl EdidInfo {
    /// Three letter PNP manufacturer code, e.g. `DEL` or `APP`
    pub fn manufacturer(&self) -> String {
        let id = self.vendor_id;
        [(id >> 10) & 0x1F, (id >> 5) & 0x1F, id & 0x1F]
            .iter()
            .map(|c| (b'A' + (*c as u8).saturating_sub(1)) as char)
            .collect()
    }

    /// Candidate connector UUIDs for this display.
    ///
    /// A platform connector UUID mirrors EDID bytes 8-23. Some platforms zero
    /// the serial, and the video input/gamma bytes vary, so two of the four
    /// candidates are regular expressions.
    pub fn possible_uuids(&self) -> Vec<String> {
        if self.year < 1990 {
            return Vec::new();
        }
        let h = &self.raw_header;
        let vendor = hex(&h[0..2]);
        let product = hex(&h[2..4]);
        let serial = hex(&h[4..8]);
        let week_year = hex(&h[8..10]);
        let size = hex(&h[13..15]);
        let (serial_hi, serial_lo) = serial.split_at(4);

        vec![
            format!("{vendor}{product}-0000-0000-{week_year}-0104B5{size}78"),
            format!("{vendor}{product}-{serial_hi}-{serial_lo}-{week_year}-0104B5{size}78"),
            format!(r"{vendor}{product}-0000-0000-{week_year}-[\dA-F]{{6}}{size}[\dA-F]{{2}}"),
            format!(
                r"{vendor}{product}-{serial_hi}-{serial_lo}-{week_year}-[\dA-F]{{6}}{size}[\dA-F]{{2}}"
            ),
        ]
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn descriptor_text(block: &[u8]) -> Option<String> {
    let text: String = block
        .iter()
        .take_while(|b| **b != 0x0A)
        .map(|b| *b as char)
        .collect();
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Parse the identity fields of an EDID base block
pub fn parse(bytes: &[u8]) -> Result<EdidInfo> {
    if bytes.len() < BASE_BLOCK_LEN {
        bail!("EDID too short: {} bytes", bytes.len());
    }
    if bytes[..8] != EDID_HEADER {
        bail!("EDID header mismatch");
    }

    let mut name = None;
    let mut serial_text = None;
    for offset in DESCRIPTOR_OFFSETS {
        let d = &bytes[offset..offset + 18];
        if d[0] != 0 || d[1] != 0 || d[2] != 0 {
            continue;
        }
        match d[3] {
            DESCRIPTOR_NAME => name = descriptor_text(&d[5..]),
            DESCRIPTOR_SERIAL => serial_text = descriptor_text(&d[5..]),
            _ => {}
        }
    }

    let mut raw_header = [0u8; 16];
    raw_header.copy_from_slice(&bytes[8..24]);

    Ok(EdidInfo {
        vendor_id: u16::from_be_bytes([bytes[8], bytes[9]]),
        product_id: u16::from_le_bytes([bytes[10], bytes[11]]),
        serial_number: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        week: bytes[16],
        year: 1990 + bytes[17] as u16,
        width_cm: bytes[21],
        height_cm: bytes[22],
        name,
        serial_text,
        raw_header,
    })
}
