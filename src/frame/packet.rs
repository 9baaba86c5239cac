// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use crate::bytes::Bytes;

/// The control byte of a datalink packet.
///
/// The multi-packet and first-packet flags are only meaningful if a
/// transmission needs more than one packet.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Control(pub(crate) u8);

impl Control {
    const MULTI_PACKET: u8 = 0x80;
    const FIRST_PACKET: u8 = 0x40;
    const TOGGLE: u8 = 0x20;

    #[must_use]
    pub const fn new(multi_packet: bool, first_packet: bool, toggle: bool) -> Self {
        let mut bits = 0;
        if multi_packet {
            bits |= Self::MULTI_PACKET;
        }
        if first_packet {
            bits |= Self::FIRST_PACKET;
        }
        if toggle {
            bits |= Self::TOGGLE;
        }
        Self(bits)
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn multi_packet(self) -> bool {
        self.0 & Self::MULTI_PACKET != 0
    }

    #[must_use]
    pub const fn first_packet(self) -> bool {
        self.0 & Self::FIRST_PACKET != 0
    }

    #[must_use]
    pub const fn toggle(self) -> bool {
        self.0 & Self::TOGGLE != 0
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("multi_packet", &self.multi_packet())
            .field("first_packet", &self.first_packet())
            .field("toggle", &self.toggle())
            .finish()
    }
}

/// A single datalink frame.
///
/// The sequence number counts down, `0` marks the last packet of a
/// transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub identity: u8,
    pub control: Control,
    pub sequence: u8,
    pub data: Bytes,
}

impl Packet {
    /// Checks if this packet starts a new transmission.
    ///
    /// This is the case for single packets and for the first packet
    /// of a multi-packet transmission.
    #[must_use]
    pub const fn starts_transmission(&self) -> bool {
        !self.control.multi_packet() || self.control.first_packet()
    }

    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.sequence == 0
    }
}
