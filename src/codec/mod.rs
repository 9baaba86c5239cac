// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding and decoding of PSEM service bodies and datalink packets.

use std::{
    borrow::Cow,
    io::{self, Cursor, Error, ErrorKind},
};

use byteorder::{BigEndian, ReadBytesExt as _};

use crate::{
    bytes::{BufMut as _, Bytes, BytesMut},
    frame::{BaudRate, Identification, Negotiated, Request, Response, ServiceCode, Timing},
    EncodingError, Outcome, ProtocolError,
};

pub mod binary;
pub mod crc;
pub mod packet;

pub use self::{
    crc::{crc16, crc_check},
    packet::{decode_packet, encode_packet, segment, ReceivedPacket, Segment, ACK, NAK, STP},
};

/// Width of the user name field of a logon request.
pub const USER_LEN: usize = 10;

/// Width of the password field of a security request.
pub const PASSWORD_LEN: usize = 20;

/// Maximum number of baud rates a negotiate request can offer.
pub const MAX_OFFERED_BAUD_RATES: usize = 11;

/// Largest offset of an offset read or write.
const MAX_OFFSET: i32 = 0x00FF_FFFF;

/// The additive checksum protecting table data: the two's complement
/// of the byte sum.
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
        .wrapping_neg()
}

fn u16_len(len: usize) -> Result<u16, EncodingError> {
    u16::try_from(len).map_err(|_| EncodingError::PayloadTooLarge { len })
}

fn put_padded(buf: &mut BytesMut, value: &str, len: usize) -> Result<(), EncodingError> {
    let bytes = value.as_bytes();
    if bytes.len() > len {
        return Err(EncodingError::StringTooLong {
            max: len,
            len: bytes.len(),
        });
    }
    buf.put_slice(bytes);
    buf.put_bytes(b' ', len - bytes.len());
    Ok(())
}

#[allow(clippy::cast_sign_loss)]
fn put_offset(buf: &mut BytesMut, offset: i32) -> Result<(), EncodingError> {
    if !(0..=MAX_OFFSET).contains(&offset) {
        return Err(EncodingError::OffsetOutOfRange(offset));
    }
    buf.put_uint(offset as u64, 3);
    Ok(())
}

fn put_table_data(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodingError> {
    buf.put_u16(u16_len(data.len())?);
    buf.put_slice(data);
    buf.put_u8(checksum(data));
    Ok(())
}

/// Wait periods of `0` seconds request the maximum.
#[must_use]
pub const fn wait_seconds(seconds: u8) -> u8 {
    if seconds == 0 {
        u8::MAX
    } else {
        seconds
    }
}

/// Append the body of `request` to `buf`.
pub fn encode_request(request: &Request<'_>, buf: &mut BytesMut) -> Result<(), EncodingError> {
    use crate::frame::Request::*;

    if let Negotiate { max_baud_rate, .. } = request {
        let count = BaudRate::offered_up_to(*max_baud_rate).len();
        if count > MAX_OFFERED_BAUD_RATES {
            return Err(EncodingError::TooManyBaudRates { count });
        }
    }
    buf.put_u8(request.service_code().value());
    match request {
        Identify | Terminate | Logoff => {}
        Negotiate {
            packet_size,
            max_packets,
            max_baud_rate,
        } => {
            buf.put_u16(*packet_size);
            buf.put_u8(*max_packets);
            for rate in BaudRate::offered_up_to(*max_baud_rate) {
                buf.put_u8(rate.code());
            }
        }
        Logon { user_id, user } => {
            buf.put_u16(*user_id);
            put_padded(buf, user, USER_LEN)?;
        }
        Security { password } => {
            put_padded(buf, password, PASSWORD_LEN)?;
        }
        Wait(seconds) => {
            buf.put_u8(wait_seconds(*seconds));
        }
        FullRead(table) => {
            buf.put_u16(*table);
        }
        OffsetRead {
            table,
            offset,
            count,
        } => {
            buf.put_u16(*table);
            put_offset(buf, *offset)?;
            buf.put_u16(*count);
        }
        FullWrite { table, data } => {
            buf.put_u16(*table);
            put_table_data(buf, data)?;
        }
        OffsetWrite {
            table,
            offset,
            data,
        } => {
            buf.put_u16(*table);
            put_offset(buf, *offset)?;
            put_table_data(buf, data)?;
        }
        TimingSetup(timing) => {
            buf.put_u8(timing.channel_traffic_timeout);
            buf.put_u8(timing.inter_character_timeout);
            buf.put_u8(timing.response_timeout);
            buf.put_u8(timing.retries);
        }
    }
    Ok(())
}

fn malformed(request: &Request<'_>, message: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedResponse {
        service: request.service_code(),
        message: message.into(),
    }
}

fn expect_len(request: &Request<'_>, rsp: &[u8], len: usize) -> Result<(), ProtocolError> {
    if rsp.len() < len {
        return Err(malformed(
            request,
            format!("{} bytes instead of at least {len}", rsp.len()),
        ));
    }
    Ok(())
}

/// Decode the response to `request`.
///
/// The first byte is the outcome code, the remaining bytes are only
/// decoded if it is [`Outcome::Ok`]. Table data with a wrong checksum
/// degrades the outcome to [`Outcome::Err`].
pub fn decode_response(
    request: &Request<'_>,
    rsp: &[u8],
) -> Result<Result<Response, Outcome>, ProtocolError> {
    use crate::frame::Request::*;

    let Some(code) = rsp.first() else {
        return Err(malformed(request, "empty response"));
    };
    let outcome = Outcome::try_from(*code)
        .map_err(|code| malformed(request, format!("unknown outcome code 0x{code:02X}")))?;
    if !outcome.is_ok() {
        return Ok(Err(outcome));
    }
    let rsp = match request {
        Identify => {
            expect_len(request, rsp, 4)?;
            let features = &rsp[4..];
            let end = features
                .iter()
                .position(|byte| *byte == 0x00)
                .unwrap_or(features.len());
            Response::Identify(Identification {
                standard: rsp[1],
                version: rsp[2],
                revision: rsp[3],
                features: Bytes::copy_from_slice(&features[..end]),
            })
        }
        Negotiate { .. } => {
            expect_len(request, rsp, 4)?;
            Response::Negotiate(Negotiated {
                packet_size: u16::from_be_bytes([rsp[1], rsp[2]]),
                max_packets: rsp[3],
                baud_rate: rsp.get(4).copied().and_then(BaudRate::from_code),
            })
        }
        FullRead(_) | OffsetRead { .. } => {
            expect_len(request, rsp, 3)?;
            let len = usize::from(u16::from_be_bytes([rsp[1], rsp[2]]));
            expect_len(request, rsp, 3 + len + 1)?;
            let data = &rsp[3..3 + len];
            let received = rsp[3 + len];
            let expected = checksum(data);
            if received != expected {
                log::warn!(
                    "Table checksum mismatch: 0x{received:02X} instead of 0x{expected:02X}"
                );
                return Ok(Err(Outcome::Err));
            }
            Response::Read(Bytes::copy_from_slice(data))
        }
        TimingSetup(_) => {
            expect_len(request, rsp, 5)?;
            Response::TimingSetup(Timing {
                channel_traffic_timeout: rsp[1],
                inter_character_timeout: rsp[2],
                response_timeout: rsp[3],
                retries: rsp[4],
            })
        }
        Logon { .. } => Response::Logon,
        Security { .. } => Response::Security,
        Wait(_) => Response::Wait,
        Terminate => Response::Terminate,
        Logoff => Response::Logoff,
        FullWrite { .. } | OffsetWrite { .. } => Response::Write,
    };
    Ok(Ok(rsp))
}

fn read_u16_be(rdr: &mut Cursor<&[u8]>) -> io::Result<u16> {
    rdr.read_u16::<BigEndian>()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn read_offset(rdr: &mut Cursor<&[u8]>) -> io::Result<i32> {
    rdr.read_uint::<BigEndian>(3).map(|offset| offset as i32)
}

fn read_padded(rdr: &mut Cursor<&[u8]>, len: usize) -> io::Result<String> {
    let start = usize::try_from(rdr.position()).unwrap_or(usize::MAX);
    let field = rdr
        .get_ref()
        .get(start..start.saturating_add(len))
        .ok_or_else(|| Error::new(ErrorKind::UnexpectedEof, "truncated string"))?;
    rdr.set_position(rdr.position() + len as u64);
    let value = String::from_utf8_lossy(field);
    Ok(value.trim_end_matches([' ', '\0']).to_owned())
}

fn read_table_data(rdr: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = usize::from(read_u16_be(rdr)?);
    let mut data = vec![0; len];
    io::Read::read_exact(rdr, &mut data)?;
    let received = rdr.read_u8()?;
    if received != checksum(&data) {
        return Err(Error::new(ErrorKind::InvalidData, "table checksum mismatch"));
    }
    Ok(data)
}

/// Decode a request body as received by a meter.
///
/// Index reads and writes are rejected with [`ErrorKind::Unsupported`].
pub fn decode_request(req: &[u8]) -> io::Result<Request<'static>> {
    use crate::frame::Request::*;

    let rdr = &mut Cursor::new(req);
    let code = ServiceCode::new(rdr.read_u8()?);
    let req = match code {
        ServiceCode::Identify => Identify,
        ServiceCode::Terminate => Terminate,
        ServiceCode::Logoff => Logoff,
        ServiceCode::Negotiate(bauds) => {
            let packet_size = read_u16_be(rdr)?;
            let max_packets = rdr.read_u8()?;
            let mut max_baud_rate = 0;
            for _ in 0..bauds {
                let rate = BaudRate::from_code(rdr.read_u8()?).map_or(0, BaudRate::bits_per_second);
                max_baud_rate = max_baud_rate.max(rate);
            }
            Negotiate {
                packet_size,
                max_packets,
                max_baud_rate,
            }
        }
        ServiceCode::Logon => Logon {
            user_id: read_u16_be(rdr)?,
            user: Cow::Owned(read_padded(rdr, USER_LEN)?),
        },
        ServiceCode::Security => Security {
            password: Cow::Owned(read_padded(rdr, PASSWORD_LEN)?),
        },
        ServiceCode::Wait => Wait(rdr.read_u8()?),
        ServiceCode::FullRead => FullRead(read_u16_be(rdr)?),
        ServiceCode::OffsetRead => OffsetRead {
            table: read_u16_be(rdr)?,
            offset: read_offset(rdr)?,
            count: read_u16_be(rdr)?,
        },
        ServiceCode::FullWrite => FullWrite {
            table: read_u16_be(rdr)?,
            data: Cow::Owned(read_table_data(rdr)?),
        },
        ServiceCode::OffsetWrite => OffsetWrite {
            table: read_u16_be(rdr)?,
            offset: read_offset(rdr)?,
            data: Cow::Owned(read_table_data(rdr)?),
        },
        ServiceCode::TimingSetup => TimingSetup(Timing {
            channel_traffic_timeout: rdr.read_u8()?,
            inter_character_timeout: rdr.read_u8()?,
            response_timeout: rdr.read_u8()?,
            retries: rdr.read_u8()?,
        }),
        ServiceCode::IndexRead(_) | ServiceCode::IndexWrite(_) | ServiceCode::Custom(_) => {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("unsupported service code {code}"),
            ));
        }
    };
    Ok(req)
}

/// Append the body of a response to `buf`, as sent by a meter.
pub fn encode_response(
    result: &Result<Response, Outcome>,
    buf: &mut BytesMut,
) -> Result<(), EncodingError> {
    let rsp = match result {
        Ok(rsp) => rsp,
        Err(outcome) => {
            buf.put_u8(outcome.value());
            return Ok(());
        }
    };
    buf.put_u8(Outcome::Ok.value());
    match rsp {
        Response::Identify(identification) => {
            buf.put_u8(identification.standard);
            buf.put_u8(identification.version);
            buf.put_u8(identification.revision);
            buf.put_slice(&identification.features);
            buf.put_u8(0x00);
        }
        Response::Negotiate(negotiated) => {
            buf.put_u16(negotiated.packet_size);
            buf.put_u8(negotiated.max_packets);
            buf.put_u8(negotiated.baud_rate.map_or(0x00, BaudRate::code));
        }
        Response::Read(data) => put_table_data(buf, data)?,
        Response::TimingSetup(timing) => {
            buf.put_u8(timing.channel_traffic_timeout);
            buf.put_u8(timing.inter_character_timeout);
            buf.put_u8(timing.response_timeout);
            buf.put_u8(timing.retries);
        }
        Response::Logon
        | Response::Security
        | Response::Wait
        | Response::Terminate
        | Response::Logoff
        | Response::Write => {}
    }
    Ok(())
}
