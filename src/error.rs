// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::io;

use thiserror::Error;

use crate::{codec::binary::TimeFormat, ServiceCode};

/// The exchange with the meter broke down.
///
/// Unlike an [`Outcome`](crate::Outcome) these errors are not an answer
/// of the meter but indicate that no (valid) answer was received.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No acknowledgement or response arrived in time.
    #[error("response timeout")]
    ResponseTimeout,

    /// The far end rejected the same packet too many times.
    #[error("packet was rejected {naks} times")]
    NakLimitExceeded { naks: usize },

    /// The retries are exhausted and the last answer was a NAK.
    #[error("packet was not acknowledged")]
    NakReceived,

    /// The response could not be decoded.
    #[error("malformed {service:?} response: {message}")]
    MalformedResponse {
        service: ServiceCode,
        message: String,
    },
}

/// Values that cannot be represented on the wire.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("string of {len} bytes exceeds the field width of {max} bytes")]
    StringTooLong { max: usize, len: usize },

    #[error("time format {0:?} is not supported")]
    UnsupportedTimeFormat(TimeFormat),

    #[error("{count} baud rates exceed the maximum of 11 offered rates")]
    TooManyBaudRates { count: usize },

    #[error("payload of {len} bytes exceeds the maximum length")]
    PayloadTooLarge { len: usize },

    #[error("table offset {0} does not fit into 24 bits")]
    OffsetOutOfRange(i32),

    #[error("{0} seconds exceed a day")]
    InvalidTimeOfDay(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// _PSEM_ result error.
#[derive(Debug, Error)]
pub enum Error {
    /// The datalink or application exchange failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A request or value could not be encoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The service is not supported by this implementation.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// Transport error, passed through from the underlying transport.
    #[error(transparent)]
    Transport(#[from] io::Error),
}

impl Error {
    /// Checks if the exchange failed because the far end stopped answering.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::ResponseTimeout))
    }
}
