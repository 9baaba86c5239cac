// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Readers and writers for the non-standard integer widths and time
//! encodings found in meter tables.
//!
//! Extended integers are assembled little-endian from two reads
//! (16 + 8 or 32 + 16 bits). Times count minutes since 1970-01-01,
//! either in meter-local or in UTC reference.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeDelta, Timelike as _, Utc};

use crate::EncodingError;

pub type Result<T> = std::result::Result<T, EncodingError>;

/// Minute count marking a time that was never set.
const UNSET: u32 = u32::MAX;

const SECONDS_PER_DAY: u32 = 86_400;

/// The layout of a time value inside a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeFormat {
    /// BCD encoded calendar fields.
    Bcd,
    /// One `u8` per calendar field.
    Discrete,
    /// `u32` minutes since 1970.
    Minutes,
    /// `u32` minutes since 1970 followed by `u8` seconds.
    MinutesAndSeconds,
}

impl TimeFormat {
    fn has_seconds(self) -> Result<bool> {
        match self {
            Self::Minutes => Ok(false),
            Self::MinutesAndSeconds => Ok(true),
            Self::Bcd | Self::Discrete => Err(EncodingError::UnsupportedTimeFormat(self)),
        }
    }
}

fn epoch() -> NaiveDateTime {
    DateTime::<Utc>::UNIX_EPOCH.naive_utc()
}

fn since_epoch(minutes: u32, seconds: u8) -> NaiveDateTime {
    let epoch = epoch();
    if minutes == UNSET {
        return epoch;
    }
    epoch
        .checked_add_signed(TimeDelta::minutes(i64::from(minutes)))
        .and_then(|time| time.checked_add_signed(TimeDelta::seconds(i64::from(seconds))))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Whole minutes between 1970-01-01 00:00 UTC and `time`.
///
/// Times before the epoch yield `0`, times too far in the future
/// saturate just below the "unset" marker.
#[must_use]
pub fn minutes_since_epoch(time: DateTime<Utc>) -> u32 {
    local_minutes_since_epoch(time.naive_utc())
}

fn local_minutes_since_epoch(time: NaiveDateTime) -> u32 {
    let minutes = (time - epoch()).num_minutes().max(0);
    u32::try_from(minutes).map_or(UNSET - 1, |minutes| minutes.min(UNSET - 1))
}

fn seconds_of(time: NaiveDateTime) -> u8 {
    // Always < 60
    time.second().try_into().unwrap_or_default()
}

/// Reads meter encodings from an underlying [`Read`]er, usually a
/// [`Cursor`](std::io::Cursor) over table data.
#[derive(Debug)]
pub struct TableReader<R> {
    inner: R,
}

impl<R: Read> TableReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub const fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8()?)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.inner.read_u16::<LittleEndian>()?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.inner.read_u32::<LittleEndian>()?)
    }

    /// Reads an unsigned 24 bit integer.
    pub fn read_u24(&mut self) -> Result<u32> {
        let low = self.read_u16()?;
        let high = self.read_u8()?;
        Ok(u32::from(high) << 16 | u32::from(low))
    }

    /// Reads a signed 24 bit integer.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_i24(&mut self) -> Result<i32> {
        let value = self.read_u24()?;
        // Move the sign bit to the top and shift back arithmetically.
        Ok(((value << 8) as i32) >> 8)
    }

    /// Reads an unsigned 48 bit integer.
    pub fn read_u48(&mut self) -> Result<u64> {
        let low = self.read_u32()?;
        let high = self.read_u16()?;
        Ok(u64::from(high) << 32 | u64::from(low))
    }

    /// Reads a signed 48 bit integer.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_i48(&mut self) -> Result<i64> {
        let value = self.read_u48()?;
        Ok(((value << 16) as i64) >> 16)
    }

    /// Reads exactly `len` bytes as a string, cut at the first NUL byte.
    pub fn read_fixed_string(&mut self, len: usize) -> Result<String> {
        let mut buf = vec![0; len];
        self.inner.read_exact(&mut buf)?;
        if let Some(end) = buf.iter().position(|byte| *byte == 0) {
            buf.truncate(end);
        }
        String::from_utf8(buf)
            .map_err(|err| EncodingError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))
    }

    /// Reads a time in meter-local reference.
    pub fn read_local_minute_epoch(&mut self, format: TimeFormat) -> Result<NaiveDateTime> {
        let with_seconds = format.has_seconds()?;
        let minutes = self.read_u32()?;
        let seconds = if with_seconds { self.read_u8()? } else { 0 };
        Ok(since_epoch(minutes, seconds))
    }

    /// Reads a time in UTC reference.
    pub fn read_utc_minute_epoch(&mut self, format: TimeFormat) -> Result<DateTime<Utc>> {
        self.read_local_minute_epoch(format)
            .map(|time| time.and_utc())
    }

    /// Reads a `u32` count of seconds since midnight.
    pub fn read_seconds_of_day(&mut self) -> Result<NaiveTime> {
        let seconds = self.read_u32()?;
        NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)
            .ok_or(EncodingError::InvalidTimeOfDay(seconds))
    }
}

/// Writes meter encodings to an underlying [`Write`]r.
#[derive(Debug)]
pub struct TableWriter<W> {
    inner: W,
}

impl<W: Write> TableWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        Ok(self.inner.write_u8(value)?)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        Ok(self.inner.write_u16::<LittleEndian>(value)?)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        Ok(self.inner.write_u32::<LittleEndian>(value)?)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_u24(&mut self, value: u32) -> Result<()> {
        self.write_u16(value as u16)?;
        self.write_u8((value >> 16) as u8)
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn write_i24(&mut self, value: i32) -> Result<()> {
        self.write_u24(value as u32 & 0x00FF_FFFF)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_u48(&mut self, value: u64) -> Result<()> {
        self.write_u32(value as u32)?;
        self.write_u16((value >> 32) as u16)
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn write_i48(&mut self, value: i64) -> Result<()> {
        self.write_u48(value as u64 & 0xFFFF_FFFF_FFFF)
    }

    /// Writes `value` into a field of `len` bytes, padded with NUL bytes.
    pub fn write_fixed_string(&mut self, value: &str, len: usize) -> Result<()> {
        self.write_padded_string(value, len, 0x00)
    }

    /// Writes `value` into a field of `len` bytes, padded with `pad`.
    pub fn write_padded_string(&mut self, value: &str, len: usize, pad: u8) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > len {
            return Err(EncodingError::StringTooLong {
                max: len,
                len: bytes.len(),
            });
        }
        self.inner.write_all(bytes)?;
        for _ in bytes.len()..len {
            self.write_u8(pad)?;
        }
        Ok(())
    }

    /// Writes a time in meter-local reference.
    pub fn write_local_minute_epoch(
        &mut self,
        time: NaiveDateTime,
        format: TimeFormat,
    ) -> Result<()> {
        let with_seconds = format.has_seconds()?;
        self.write_u32(local_minutes_since_epoch(time))?;
        if with_seconds {
            self.write_u8(seconds_of(time))?;
        }
        Ok(())
    }

    /// Writes a time in UTC reference.
    pub fn write_utc_minute_epoch(&mut self, time: DateTime<Utc>, format: TimeFormat) -> Result<()> {
        self.write_local_minute_epoch(time.naive_utc(), format)
    }

    pub fn write_seconds_of_day(&mut self, time: NaiveTime) -> Result<()> {
        debug_assert!(time.num_seconds_from_midnight() < SECONDS_PER_DAY);
        self.write_u32(time.num_seconds_from_midnight())
    }
}
