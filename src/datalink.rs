// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Datalink layer: packet framing, acknowledgement, retransmission,
//! duplicate suppression and multi-packet reassembly.

use std::{io, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    bytes::{Bytes, BytesMut},
    codec::{
        decode_packet, encode_packet,
        packet::{HEADER_LEN, OVERHEAD},
        segment, ReceivedPacket, ACK, NAK, STP,
    },
    frame::{Control, Packet},
    stats::Statistics,
    transport::{Transport, DEFAULT_BAUD_RATE},
    Error, ProtocolError,
};

/// A far end that rejects the same packet this often gives up on it.
pub const MAX_NAKS: usize = 3;

/// The parameters a protocol variant starts a session with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVariant {
    pub name: &'static str,
    /// Bytes of each packet that do not carry payload.
    pub overhead: usize,
    pub max_packet_size: u16,
    pub max_packets: u8,
    pub response_timeout: Duration,
    pub channel_traffic_timeout: Duration,
    pub inter_character_timeout: Duration,
    pub retries: u8,
    pub baud_rate: u32,
    pub identity: u8,
}

impl ProtocolVariant {
    /// ANSI C12.18, point-to-point over an optical port.
    pub const C12_18: Self = Self {
        name: "ANSI C12.18",
        overhead: OVERHEAD,
        max_packet_size: 64,
        max_packets: 1,
        response_timeout: Duration::from_millis(2_000),
        channel_traffic_timeout: Duration::from_millis(6_000),
        inter_character_timeout: Duration::from_millis(500),
        retries: 3,
        baud_rate: DEFAULT_BAUD_RATE,
        identity: 0,
    };
}

impl Default for ProtocolVariant {
    fn default() -> Self {
        Self::C12_18
    }
}

/// The live parameters and memory of the datalink layer.
///
/// Negotiate and timing setup change the parameters, the toggle bit
/// and the identification of the last received packet are updated by
/// every exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub response_timeout: Duration,
    pub channel_traffic_timeout: Duration,
    pub inter_character_timeout: Duration,
    pub max_packet_size: u16,
    pub max_packets: u8,
    pub retries: u8,
    pub identity: u8,
    pub baud_rate: u32,
    send_toggle: bool,
    last_received: Option<(bool, u16)>,
}

impl LinkState {
    #[must_use]
    pub fn new(variant: &ProtocolVariant) -> Self {
        Self {
            response_timeout: variant.response_timeout,
            channel_traffic_timeout: variant.channel_traffic_timeout,
            inter_character_timeout: variant.inter_character_timeout,
            max_packet_size: variant.max_packet_size,
            max_packets: variant.max_packets,
            retries: variant.retries,
            identity: variant.identity,
            baud_rate: variant.baud_rate,
            send_toggle: false,
            last_received: None,
        }
    }

    /// The toggle bit of the last sent packet.
    #[must_use]
    pub const fn send_toggle(&self) -> bool {
        self.send_toggle
    }

    /// Toggle bit and CRC of the last accepted packet.
    #[must_use]
    pub const fn last_received(&self) -> Option<(bool, u16)> {
        self.last_received
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acknowledgement {
    Ack,
    Nak,
    Garbage(u8),
    Timeout,
}

/// The datalink layer on top of a [`Transport`].
#[derive(Debug)]
pub struct Datalink<T> {
    transport: T,
    variant: ProtocolVariant,
    state: LinkState,
    stats: Arc<Statistics>,
}

impl<T> Datalink<T> {
    pub fn new(transport: T, variant: ProtocolVariant, stats: Arc<Statistics>) -> Self {
        let state = LinkState::new(&variant);
        Self {
            transport,
            variant,
            state,
            stats,
        }
    }

    pub fn variant(&self) -> &ProtocolVariant {
        &self.variant
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut LinkState {
        &mut self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }
}

impl<T: Transport> Datalink<T> {
    fn ensure_open(&self) -> io::Result<()> {
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closed",
            ))
        }
    }

    /// Send `payload`, split into as many packets as needed.
    ///
    /// Each packet must be acknowledged before the next one is sent.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let segments = segment(
            payload,
            usize::from(self.state.max_packet_size),
            self.variant.overhead,
        )?;
        for segment in segments {
            self.state.send_toggle = !self.state.send_toggle;
            let packet = Packet {
                identity: self.state.identity,
                control: Control::new(
                    segment.multi_packet,
                    segment.first_packet,
                    self.state.send_toggle,
                ),
                sequence: segment.sequence,
                data: Bytes::copy_from_slice(segment.data),
            };
            let mut frame = BytesMut::new();
            encode_packet(&packet, &mut frame)?;
            self.send_packet(&frame).await?;
        }
        Ok(())
    }

    async fn send_packet(&mut self, frame: &[u8]) -> Result<(), Error> {
        let attempts = usize::from(self.state.retries) + 1;
        let mut naks = 0;
        for attempt in 1..=attempts {
            if attempt > 1 {
                log::warn!("Resending packet, attempt {attempt} of {attempts}");
            }
            log::trace!("Send packet {frame:02X?}");
            self.transport.send(frame).await?;
            match self.await_acknowledgement().await? {
                Acknowledgement::Ack => {
                    log::trace!("Received ACK");
                    self.stats.record_ack_received();
                    return Ok(());
                }
                Acknowledgement::Nak => {
                    naks += 1;
                    log::trace!("Received NAK");
                    self.stats.record_nak_received();
                    if naks >= MAX_NAKS {
                        log::warn!("Packet was rejected {naks} times");
                        return Err(ProtocolError::NakLimitExceeded { naks }.into());
                    }
                }
                Acknowledgement::Garbage(byte) => {
                    log::warn!("Unexpected byte 0x{byte:02X} instead of an acknowledgement");
                    self.transport.clear_input().await?;
                }
                Acknowledgement::Timeout => {
                    log::warn!("No acknowledgement within {:?}", self.state.response_timeout);
                    self.stats.record_timeout();
                }
            }
        }
        let err = if naks > 0 {
            ProtocolError::NakReceived
        } else {
            ProtocolError::ResponseTimeout
        };
        self.transport.clear_input().await?;
        Err(err.into())
    }

    async fn await_acknowledgement(&mut self) -> Result<Acknowledgement, Error> {
        let mut deadline = Instant::now() + self.state.response_timeout;
        let mut byte = [0];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.transport.read(&mut byte, remaining).await? == 0 {
                return Ok(Acknowledgement::Timeout);
            }
            match byte[0] {
                ACK => return Ok(Acknowledgement::Ack),
                NAK => return Ok(Acknowledgement::Nak),
                STP => {
                    self.handle_unsolicited_packet().await?;
                    deadline = Instant::now() + self.state.response_timeout;
                }
                other => return Ok(Acknowledgement::Garbage(other)),
            }
        }
    }

    /// A packet arrived while waiting for an acknowledgement, usually
    /// because our ACK of the far end's last packet got lost.
    async fn handle_unsolicited_packet(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.state.channel_traffic_timeout;
        let Some(frame) = self.read_packet_after_start(deadline).await? else {
            log::debug!("Incomplete unsolicited packet");
            return Ok(());
        };
        match decode_packet(&frame) {
            Ok(ReceivedPacket { packet, crc })
                if self.state.last_received == Some((packet.control.toggle(), crc)) =>
            {
                log::debug!("Acknowledging repeated packet");
                self.send_control(ACK).await?;
            }
            Ok(_) => {
                log::debug!("Ignoring unsolicited packet");
            }
            Err(err) => {
                log::debug!("Ignoring unsolicited packet: {err}");
            }
        }
        Ok(())
    }

    /// Receive a complete transmission and return its reassembled payload.
    pub async fn receive(&mut self) -> Result<Bytes, Error> {
        self.ensure_open()?;
        let mut assembly = BytesMut::new();
        let mut started = false;
        let mut deadline = Instant::now() + self.state.channel_traffic_timeout;
        loop {
            let Some(frame) = self.read_packet(deadline).await? else {
                log::warn!(
                    "No complete response within {:?}",
                    self.state.channel_traffic_timeout
                );
                self.stats.record_timeout();
                self.transport.clear_input().await?;
                return Err(ProtocolError::ResponseTimeout.into());
            };
            let ReceivedPacket { packet, crc } = match decode_packet(&frame) {
                Ok(received) => received,
                Err(err) => {
                    log::warn!("Rejecting packet: {err}");
                    self.transport.clear_input().await?;
                    self.send_control(NAK).await?;
                    continue;
                }
            };
            let id = (packet.control.toggle(), crc);
            if self.state.last_received == Some(id) {
                log::debug!("Acknowledging duplicate packet {}", packet.sequence);
                self.send_control(ACK).await?;
                deadline = Instant::now() + self.state.channel_traffic_timeout;
                continue;
            }
            // Some meters start with a continuation packet.
            if packet.starts_transmission() || !started {
                assembly.clear();
                started = true;
            }
            assembly.extend_from_slice(&packet.data);
            self.state.last_received = Some(id);
            self.send_control(ACK).await?;
            if packet.is_last() {
                return Ok(assembly.freeze());
            }
            deadline = Instant::now() + self.state.channel_traffic_timeout;
        }
    }

    /// Hunt for the start byte and read the rest of the packet.
    ///
    /// Returns `None` if the deadline passed first.
    async fn read_packet(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        let mut byte = [0];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.transport.read(&mut byte, remaining).await? == 0 {
                return Ok(None);
            }
            if byte[0] != STP {
                log::trace!("Skipping byte 0x{:02X}", byte[0]);
                continue;
            }
            if let Some(frame) = self.read_packet_after_start(deadline).await? {
                return Ok(Some(frame));
            }
            log::warn!("Discarding partly received packet");
        }
    }

    async fn read_packet_after_start(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        let mut frame = vec![0; 1 + HEADER_LEN];
        frame[0] = STP;
        if !self.read_exact_until(&mut frame[1..], deadline).await? {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([frame[4], frame[5]]));
        frame.resize(OVERHEAD + len, 0);
        if !self
            .read_exact_until(&mut frame[1 + HEADER_LEN..], deadline)
            .await?
        {
            return Ok(None);
        }
        log::trace!("Received packet {frame:02X?}");
        Ok(Some(frame))
    }

    /// Fill `buf`, allowing at most the inter-character timeout between
    /// two reads. Returns `false` if the buffer could not be filled.
    async fn read_exact_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let timeout = self
                .state
                .inter_character_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            if timeout.is_zero() {
                return Ok(false);
            }
            let count = self.transport.read(&mut buf[filled..], timeout).await?;
            if count == 0 {
                return Ok(false);
            }
            filled += count;
        }
        Ok(true)
    }

    async fn send_control(&mut self, byte: u8) -> io::Result<()> {
        self.transport.send(&[byte]).await?;
        if byte == ACK {
            log::trace!("Sent ACK");
            self.stats.record_ack_sent();
        } else {
            log::trace!("Sent NAK");
            self.stats.record_nak_sent();
        }
        Ok(())
    }
}
