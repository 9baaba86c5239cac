// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

pub(crate) mod packet;

pub use self::packet::{Control, Packet};

use std::{
    borrow::Cow,
    error,
    fmt::{self, Display},
};

use crate::bytes::Bytes;

/// A PSEM service code.
///
/// All request codes as defined by ANSI C12.18.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCode {
    /// 32 (0x20) Identification
    Identify,

    /// 33 (0x21) Terminate
    Terminate,

    /// 48 (0x30) Full table read
    FullRead,

    /// 49..57 (0x31..0x39) Partial table read by index, with the number of index fields.
    IndexRead(u8),

    /// 63 (0x3F) Partial table read by offset
    OffsetRead,

    /// 64 (0x40) Full table write
    FullWrite,

    /// 65..73 (0x41..0x49) Partial table write by index, with the number of index fields.
    IndexWrite(u8),

    /// 79 (0x4F) Partial table write by offset
    OffsetWrite,

    /// 80 (0x50) Logon
    Logon,

    /// 81 (0x51) Security
    Security,

    /// 82 (0x52) Logoff
    Logoff,

    /// 96..107 (0x60..0x6B) Negotiate, with the number of offered baud rates.
    Negotiate(u8),

    /// 112 (0x70) Wait
    Wait,

    /// 113 (0x71) Timing setup
    TimingSetup,

    /// Any other request code.
    Custom(u8),
}

impl ServiceCode {
    /// Create a new [`ServiceCode`] with `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value {
            0x20 => Self::Identify,
            0x21 => Self::Terminate,
            0x30 => Self::FullRead,
            0x31..=0x39 => Self::IndexRead(value - 0x30),
            0x3F => Self::OffsetRead,
            0x40 => Self::FullWrite,
            0x41..=0x49 => Self::IndexWrite(value - 0x40),
            0x4F => Self::OffsetWrite,
            0x50 => Self::Logon,
            0x51 => Self::Security,
            0x52 => Self::Logoff,
            0x60..=0x6B => Self::Negotiate(value - 0x60),
            0x70 => Self::Wait,
            0x71 => Self::TimingSetup,
            code => Self::Custom(code),
        }
    }

    /// Gets the [`u8`] value of the current [`ServiceCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Identify => 0x20,
            Self::Terminate => 0x21,
            Self::FullRead => 0x30,
            Self::IndexRead(fields) => 0x30 + fields,
            Self::OffsetRead => 0x3F,
            Self::FullWrite => 0x40,
            Self::IndexWrite(fields) => 0x40 + fields,
            Self::OffsetWrite => 0x4F,
            Self::Logon => 0x50,
            Self::Security => 0x51,
            Self::Logoff => 0x52,
            Self::Negotiate(bauds) => 0x60 + bauds,
            Self::Wait => 0x70,
            Self::TimingSetup => 0x71,
            Self::Custom(code) => code,
        }
    }
}

impl Display for ServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.value())
    }
}

/// The outcome code every PSEM response starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// 0x00 Acknowledge, no problems
    Ok,
    /// 0x01 Error, rejection of the received service request
    Err,
    /// 0x02 Service not supported
    ServiceNotSupported,
    /// 0x03 Insufficient security clearance
    InsufficientSecurityClearance,
    /// 0x04 Operation not possible
    OperationNotPossible,
    /// 0x05 Inappropriate action requested
    InappropriateActionRequested,
    /// 0x06 Device busy
    DeviceBusy,
    /// 0x07 Data not ready
    DataNotReady,
    /// 0x08 Data locked
    DataLocked,
    /// 0x09 Renegotiate request
    RenegotiateRequest,
    /// 0x0A Invalid service sequence state
    InvalidServiceSequenceState,
}

impl Outcome {
    /// All outcome codes in the order of their value.
    pub const ALL: [Self; 11] = [
        Self::Ok,
        Self::Err,
        Self::ServiceNotSupported,
        Self::InsufficientSecurityClearance,
        Self::OperationNotPossible,
        Self::InappropriateActionRequested,
        Self::DeviceBusy,
        Self::DataNotReady,
        Self::DataLocked,
        Self::RenegotiateRequest,
        Self::InvalidServiceSequenceState,
    ];

    /// Gets the [`u8`] value of the current [`Outcome`].
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Err => 0x01,
            Self::ServiceNotSupported => 0x02,
            Self::InsufficientSecurityClearance => 0x03,
            Self::OperationNotPossible => 0x04,
            Self::InappropriateActionRequested => 0x05,
            Self::DeviceBusy => 0x06,
            Self::DataNotReady => 0x07,
            Self::DataLocked => 0x08,
            Self::RenegotiateRequest => 0x09,
            Self::InvalidServiceSequenceState => 0x0A,
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::Err => "Error",
            Self::ServiceNotSupported => "Service not supported",
            Self::InsufficientSecurityClearance => "Insufficient security clearance",
            Self::OperationNotPossible => "Operation not possible",
            Self::InappropriateActionRequested => "Inappropriate action requested",
            Self::DeviceBusy => "Device busy",
            Self::DataNotReady => "Data not ready",
            Self::DataLocked => "Data locked",
            Self::RenegotiateRequest => "Renegotiate request",
            Self::InvalidServiceSequenceState => "Invalid service sequence state",
        }
    }
}

impl TryFrom<u8> for Outcome {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(value)).copied().ok_or(value)
    }
}

impl From<Outcome> for u8 {
    fn from(from: Outcome) -> Self {
        from.value()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl error::Error for Outcome {}

/// Baud rate codes used by the negotiate service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaudRate {
    /// 0x01
    B300,
    /// 0x02
    B600,
    /// 0x03
    B1200,
    /// 0x04
    B2400,
    /// 0x05
    B4800,
    /// 0x06
    B9600,
    /// 0x07
    B14400,
    /// 0x08
    B19200,
    /// 0x09
    B28800,
    /// 0x0A
    B57600,
    /// 0x0B
    B38400,
    /// 0x0C
    B115200,
    /// 0x0D
    B128000,
    /// 0x0E
    B256000,
}

impl BaudRate {
    /// All known rates, sorted by descending bit rate.
    const DESCENDING: [Self; 14] = [
        Self::B256000,
        Self::B128000,
        Self::B115200,
        Self::B57600,
        Self::B38400,
        Self::B28800,
        Self::B19200,
        Self::B14400,
        Self::B9600,
        Self::B4800,
        Self::B2400,
        Self::B1200,
        Self::B600,
        Self::B300,
    ];

    /// Map a negotiate code to its rate, `None` for `0x00` (externally
    /// defined) and unknown codes.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        let rate = match code {
            0x01 => Self::B300,
            0x02 => Self::B600,
            0x03 => Self::B1200,
            0x04 => Self::B2400,
            0x05 => Self::B4800,
            0x06 => Self::B9600,
            0x07 => Self::B14400,
            0x08 => Self::B19200,
            0x09 => Self::B28800,
            0x0A => Self::B57600,
            0x0B => Self::B38400,
            0x0C => Self::B115200,
            0x0D => Self::B128000,
            0x0E => Self::B256000,
            _ => return None,
        };
        Some(rate)
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::B300 => 0x01,
            Self::B600 => 0x02,
            Self::B1200 => 0x03,
            Self::B2400 => 0x04,
            Self::B4800 => 0x05,
            Self::B9600 => 0x06,
            Self::B14400 => 0x07,
            Self::B19200 => 0x08,
            Self::B28800 => 0x09,
            Self::B57600 => 0x0A,
            Self::B38400 => 0x0B,
            Self::B115200 => 0x0C,
            Self::B128000 => 0x0D,
            Self::B256000 => 0x0E,
        }
    }

    #[must_use]
    pub const fn bits_per_second(self) -> u32 {
        match self {
            Self::B300 => 300,
            Self::B600 => 600,
            Self::B1200 => 1_200,
            Self::B2400 => 2_400,
            Self::B4800 => 4_800,
            Self::B9600 => 9_600,
            Self::B14400 => 14_400,
            Self::B19200 => 19_200,
            Self::B28800 => 28_800,
            Self::B57600 => 57_600,
            Self::B38400 => 38_400,
            Self::B115200 => 115_200,
            Self::B128000 => 128_000,
            Self::B256000 => 256_000,
        }
    }

    /// The rates offered when negotiating up to `max_bits_per_second`,
    /// fastest first.
    #[must_use]
    pub fn offered_up_to(max_bits_per_second: u32) -> Vec<Self> {
        Self::DESCENDING
            .into_iter()
            .filter(|rate| rate.bits_per_second() <= max_bits_per_second)
            .collect()
    }
}

impl Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Bd", self.bits_per_second())
    }
}

/// The number of a meter table.
pub type TableId = u16;

/// Timing parameters exchanged by the timing setup service, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub channel_traffic_timeout: u8,
    pub inter_character_timeout: u8,
    pub response_timeout: u8,
    pub retries: u8,
}

/// The answer to an identify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    /// Reference standard, `0x00` for ANSI C12.18.
    pub standard: u8,
    pub version: u8,
    pub revision: u8,
    /// Raw feature bytes following the revision, without the end-of-list marker.
    pub features: Bytes,
}

/// The values granted by the negotiate service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub packet_size: u16,
    pub max_packets: u8,
    /// `None` if the meter answered with an externally defined or unknown code.
    pub baud_rate: Option<BaudRate>,
}

/// A request represents a message from the client to the meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// Ask the meter for its protocol standard and version.
    Identify,

    /// Propose a packet size, a maximum number of packets per
    /// transmission and the fastest acceptable baud rate.
    Negotiate {
        packet_size: u16,
        max_packets: u8,
        max_baud_rate: u32,
    },

    /// Open a session for a user.
    Logon { user_id: u16, user: Cow<'a, str> },

    /// Supply the password for the session.
    Security { password: Cow<'a, str> },

    /// Keep the session open for the given number of seconds.
    Wait(u8),

    /// Abort the session immediately.
    Terminate,

    /// Close the session gracefully.
    Logoff,

    /// Read a whole table.
    FullRead(TableId),

    /// Read `count` bytes of a table starting at `offset`.
    OffsetRead {
        table: TableId,
        offset: i32,
        count: u16,
    },

    /// Replace a whole table.
    FullWrite {
        table: TableId,
        data: Cow<'a, [u8]>,
    },

    /// Write into a table starting at `offset`.
    OffsetWrite {
        table: TableId,
        offset: i32,
        data: Cow<'a, [u8]>,
    },

    /// Propose new datalink timing parameters.
    TimingSetup(Timing),
}

impl Request<'_> {
    /// Converts the request into an owned instance with `'static'` lifetime.
    #[must_use]
    pub fn into_owned(self) -> Request<'static> {
        use Request::*;

        match self {
            Identify => Identify,
            Negotiate {
                packet_size,
                max_packets,
                max_baud_rate,
            } => Negotiate {
                packet_size,
                max_packets,
                max_baud_rate,
            },
            Logon { user_id, user } => Logon {
                user_id,
                user: Cow::Owned(user.into_owned()),
            },
            Security { password } => Security {
                password: Cow::Owned(password.into_owned()),
            },
            Wait(seconds) => Wait(seconds),
            Terminate => Terminate,
            Logoff => Logoff,
            FullRead(table) => FullRead(table),
            OffsetRead {
                table,
                offset,
                count,
            } => OffsetRead {
                table,
                offset,
                count,
            },
            FullWrite { table, data } => FullWrite {
                table,
                data: Cow::Owned(data.into_owned()),
            },
            OffsetWrite {
                table,
                offset,
                data,
            } => OffsetWrite {
                table,
                offset,
                data: Cow::Owned(data.into_owned()),
            },
            TimingSetup(timing) => TimingSetup(timing),
        }
    }

    /// Get the [`ServiceCode`] of the [`Request`].
    ///
    /// The negotiate code depends on the number of offered baud rates.
    #[must_use]
    pub fn service_code(&self) -> ServiceCode {
        use Request::*;

        match self {
            Identify => ServiceCode::Identify,
            Negotiate { max_baud_rate, .. } => {
                let offered = BaudRate::offered_up_to(*max_baud_rate).len();
                ServiceCode::Negotiate(u8::try_from(offered).unwrap_or(u8::MAX))
            }
            Logon { .. } => ServiceCode::Logon,
            Security { .. } => ServiceCode::Security,
            Wait(_) => ServiceCode::Wait,
            Terminate => ServiceCode::Terminate,
            Logoff => ServiceCode::Logoff,
            FullRead(_) => ServiceCode::FullRead,
            OffsetRead { .. } => ServiceCode::OffsetRead,
            FullWrite { .. } => ServiceCode::FullWrite,
            OffsetWrite { .. } => ServiceCode::OffsetWrite,
            TimingSetup(_) => ServiceCode::TimingSetup,
        }
    }
}

/// The decoded data of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Identify(Identification),
    Negotiate(Negotiated),
    Logon,
    Security,
    Wait,
    Terminate,
    Logoff,
    /// Table data of a full or offset read, checksum already verified.
    Read(Bytes),
    Write,
    TimingSetup(Timing),
}
