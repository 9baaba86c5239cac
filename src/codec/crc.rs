// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The CRC-16 variant protecting datalink packets.
//!
//! Polynomial 0x1021 processed LSB first (reflected constant 0x8408),
//! seeded with the inverted first two bytes and flushed with two zero
//! bytes. The result is inverted and byte-swapped, so writing it big-endian
//! puts the low-order byte on the wire first.

const POLY: u16 = 0x8408;

fn crc_byte(crc: u16, byte: u8) -> u16 {
    let mut crc = crc;
    let mut octet = byte;
    for _ in 0..8 {
        let carry = crc & 0x0001 != 0;
        crc >>= 1;
        if octet & 0x01 != 0 {
            crc |= 0x8000;
        }
        if carry {
            crc ^= POLY;
        }
        octet >>= 1;
    }
    crc
}

/// Calculate the CRC of `buf`.
///
/// Buffers shorter than two bytes are padded with zeros.
#[must_use]
pub fn crc16(buf: &[u8]) -> u16 {
    let first = buf.first().copied().unwrap_or_default();
    let second = buf.get(1).copied().unwrap_or_default();
    let mut crc = u16::from_le_bytes([!first, !second]);
    for byte in buf.iter().skip(2) {
        crc = crc_byte(crc, *byte);
    }
    crc = crc_byte(crc, 0x00);
    crc = crc_byte(crc, 0x00);
    (!crc).swap_bytes()
}

/// Check `buf` against a received CRC.
#[must_use]
pub fn crc_check(buf: &[u8], crc: u16) -> bool {
    crc16(buf) == crc
}
