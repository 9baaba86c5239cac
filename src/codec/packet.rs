// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Datalink packet framing.

use std::io::{self, Cursor, Error, ErrorKind};

use byteorder::{BigEndian, ReadBytesExt as _};

use crate::{
    bytes::{BufMut as _, Bytes, BytesMut},
    frame::{Control, Packet},
    EncodingError,
};

use super::crc::crc16;

/// Start of packet.
pub const STP: u8 = 0xEE;

/// Positive acknowledgement.
pub const ACK: u8 = 0x06;

/// Negative acknowledgement.
pub const NAK: u8 = 0x15;

/// Length of the header following the start byte:
/// identity + control + sequence + length.
pub const HEADER_LEN: usize = 5;

pub const CRC_LEN: usize = 2;

/// Bytes of a packet that do not carry payload.
pub const OVERHEAD: usize = 1 + HEADER_LEN + CRC_LEN;

/// The header fields of a packet, without the start byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub identity: u8,
    pub control: Control,
    pub sequence: u8,
    pub length: u16,
}

impl PacketHeader {
    #[must_use]
    pub fn parse(buf: [u8; HEADER_LEN]) -> Self {
        Self {
            identity: buf[0],
            control: Control::from_bits(buf[1]),
            sequence: buf[2],
            length: u16::from_be_bytes([buf[3], buf[4]]),
        }
    }
}

/// A decoded packet together with the CRC it was received with.
///
/// The CRC identifies a packet for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub packet: Packet,
    pub crc: u16,
}

/// Append the complete frame of `packet` to `buf`.
pub fn encode_packet(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodingError> {
    let len = u16::try_from(packet.data.len())
        .map_err(|_| EncodingError::PayloadTooLarge {
            len: packet.data.len(),
        })?;
    let start = buf.len();
    buf.reserve(OVERHEAD + packet.data.len());
    buf.put_u8(STP);
    buf.put_u8(packet.identity);
    buf.put_u8(packet.control.bits());
    buf.put_u8(packet.sequence);
    buf.put_u16(len);
    buf.put_slice(&packet.data);
    let crc = crc16(&buf[start..]);
    buf.put_u16(crc);
    Ok(())
}

/// Decode a complete frame, from the start byte up to and including the CRC.
///
/// # Errors
///
/// [`ErrorKind::UnexpectedEof`] if the frame is shorter than its length
/// field announces and [`ErrorKind::InvalidData`] if the start byte or
/// the CRC is wrong.
pub fn decode_packet(frame: &[u8]) -> io::Result<ReceivedPacket> {
    if frame.first() != Some(&STP) {
        return Err(Error::new(ErrorKind::InvalidData, "missing start byte"));
    }
    if frame.len() < OVERHEAD {
        return Err(Error::new(ErrorKind::UnexpectedEof, "incomplete header"));
    }
    let mut header = [0; HEADER_LEN];
    header.copy_from_slice(&frame[1..=HEADER_LEN]);
    let header = PacketHeader::parse(header);
    let data_end = 1 + HEADER_LEN + usize::from(header.length);
    if frame.len() < data_end + CRC_LEN {
        return Err(Error::new(ErrorKind::UnexpectedEof, "incomplete packet"));
    }
    let crc = Cursor::new(&frame[data_end..data_end + CRC_LEN]).read_u16::<BigEndian>()?;
    let expected_crc = crc16(&frame[..data_end]);
    if expected_crc != crc {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("CRC is not correct: 0x{crc:04X} instead of 0x{expected_crc:04X}"),
        ));
    }
    let packet = Packet {
        identity: header.identity,
        control: header.control,
        sequence: header.sequence,
        data: Bytes::copy_from_slice(&frame[1 + HEADER_LEN..data_end]),
    };
    Ok(ReceivedPacket { packet, crc })
}

/// One packet's share of an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub sequence: u8,
    pub multi_packet: bool,
    pub first_packet: bool,
    pub data: &'a [u8],
}

/// Number of packets needed for `len` payload bytes.
///
/// An exact multiple of the capacity does not get an extra empty packet,
/// an empty payload still needs one.
#[must_use]
pub fn packet_count(len: usize, capacity: usize) -> usize {
    let mut count = len / capacity;
    if len % capacity != 0 || count == 0 {
        count += 1;
    }
    count
}

/// Split `payload` into packets of at most `max_packet_size` bytes.
///
/// Sequence numbers count down to `0`. The multi-packet flag is set on
/// all packets of a transmission that needs more than one, the
/// first-packet flag only on the first of them.
pub fn segment(
    payload: &[u8],
    max_packet_size: usize,
    overhead: usize,
) -> Result<Vec<Segment<'_>>, EncodingError> {
    let capacity = max_packet_size.saturating_sub(overhead).max(1);
    let count = packet_count(payload.len(), capacity);
    let last_sequence = u8::try_from(count - 1).map_err(|_| EncodingError::PayloadTooLarge {
        len: payload.len(),
    })?;
    let multi_packet = count > 1;
    if payload.is_empty() {
        return Ok(vec![Segment {
            sequence: 0,
            multi_packet,
            first_packet: false,
            data: payload,
        }]);
    }
    let segments = payload
        .chunks(capacity)
        .zip((0..=last_sequence).rev())
        .map(|(data, sequence)| Segment {
            sequence,
            multi_packet,
            first_packet: multi_packet && sequence == last_sequence,
            data,
        })
        .collect();
    Ok(segments)
}
