// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Application layer: the PSEM services on top of the datalink layer.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    bytes::{Bytes, BytesMut},
    codec::{decode_response, encode_request},
    datalink::{Datalink, LinkState, ProtocolVariant},
    frame::{Identification, Negotiated, Request, Response, TableId, Timing},
    stats::Statistics,
    transport::{Transport, DEFAULT_BAUD_RATE},
    Error, Outcome, ProtocolError, Result,
};

/// Time the meter needs to switch its baud rate after answering.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// The table collaborator contract: byte-oriented access to meter tables.
#[async_trait]
pub trait TableAccess: Send {
    /// Read a whole table.
    async fn full_read(&mut self, table: TableId) -> Result<Bytes>;

    /// Read `count` bytes of a table starting at `offset`.
    async fn offset_read(&mut self, table: TableId, offset: i32, count: u16) -> Result<Bytes>;

    /// Replace a whole table.
    async fn full_write(&mut self, table: TableId, data: &[u8]) -> Result<()>;

    /// Write into a table starting at `offset`.
    async fn offset_write(&mut self, table: TableId, offset: i32, data: &[u8]) -> Result<()>;
}

/// The application layer on top of a [`Transport`].
#[derive(Debug)]
pub struct Application<T> {
    link: Datalink<T>,
    user_id: u16,
}

impl<T> Application<T> {
    pub fn new(transport: T, variant: ProtocolVariant, stats: Arc<Statistics>) -> Self {
        Self {
            link: Datalink::new(transport, variant, stats),
            user_id: 0,
        }
    }

    pub fn datalink(&self) -> &Datalink<T> {
        &self.link
    }

    pub fn datalink_mut(&mut self) -> &mut Datalink<T> {
        &mut self.link
    }

    pub fn link_state(&self) -> &LinkState {
        self.link.state()
    }

    /// The user id of the last successful logon.
    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        self.link.statistics()
    }

    pub fn into_transport(self) -> T {
        self.link.into_transport()
    }
}

fn unit(result: std::result::Result<Response, Outcome>) -> std::result::Result<(), Outcome> {
    result.map(|_| ())
}

impl<T: Transport> Application<T> {
    /// Send a request and decode the response.
    pub async fn call(&mut self, request: Request<'_>) -> Result<Response> {
        log::debug!("Call {:?}", request.service_code());
        let mut body = BytesMut::new();
        encode_request(&request, &mut body)?;
        self.link.send(&body).await?;
        let rsp = self.link.receive().await?;
        let result = decode_response(&request, &rsp)?;
        let outcome = result.as_ref().err().copied().unwrap_or(Outcome::Ok);
        self.link.statistics().record_outcome(outcome);
        log::debug!("{:?} outcome: {outcome}", request.service_code());
        Ok(result)
    }

    pub async fn identify(&mut self) -> Result<Identification> {
        self.call(Request::Identify).await.map(|result| {
            result.map(|rsp| match rsp {
                Response::Identify(identification) => identification,
                _ => unreachable!("call() should reject mismatching responses"),
            })
        })
    }

    /// Propose a packet size, a number of packets per transmission and the
    /// fastest acceptable baud rate.
    ///
    /// The packet size is limited to what the transport supports. The
    /// granted values take effect immediately, a new baud rate after a
    /// short delay for the meter to switch.
    pub async fn negotiate(
        &mut self,
        packet_size: u16,
        max_packets: u8,
        max_baud_rate: u32,
    ) -> Result<Negotiated> {
        let packet_size = packet_size.min(self.link.transport().max_supported_packet_size());
        let result = self
            .call(Request::Negotiate {
                packet_size,
                max_packets,
                max_baud_rate,
            })
            .await?;
        let negotiated = match result {
            Ok(Response::Negotiate(negotiated)) => negotiated,
            Ok(_) => unreachable!("call() should reject mismatching responses"),
            Err(outcome) => return Ok(Err(outcome)),
        };
        log::debug!("Negotiated {negotiated:?}");
        let state = self.link.state_mut();
        state.max_packet_size = negotiated.packet_size;
        state.max_packets = negotiated.max_packets;
        if let Some(baud_rate) = negotiated.baud_rate {
            self.switch_baud_rate(baud_rate.bits_per_second()).await?;
        }
        Ok(Ok(negotiated))
    }

    async fn switch_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        tokio::time::sleep(SETTLE_DELAY).await;
        self.link.transport_mut().set_baud_rate(baud_rate)?;
        self.link.state_mut().baud_rate = baud_rate;
        log::debug!("Baud rate is now {baud_rate}");
        Ok(())
    }

    pub async fn logon(&mut self, user: &str, user_id: u16) -> Result<()> {
        let result = self
            .call(Request::Logon {
                user_id,
                user: Cow::Borrowed(user),
            })
            .await?;
        if result.is_ok() {
            self.user_id = user_id;
        }
        Ok(unit(result))
    }

    pub async fn security(&mut self, password: &str) -> Result<()> {
        self.call(Request::Security {
            password: Cow::Borrowed(password),
        })
        .await
        .map(unit)
    }

    /// Ask the meter to keep the session open for `seconds`, `0` requests
    /// the maximum of 255 seconds.
    ///
    /// A meter that already dropped the session answers with
    /// [`Outcome::InvalidServiceSequenceState`], which is reported as
    /// [`ProtocolError::ResponseTimeout`].
    pub async fn wait(&mut self, seconds: u8) -> Result<()> {
        match self.call(Request::Wait(seconds)).await? {
            Err(Outcome::InvalidServiceSequenceState) => {
                log::warn!("Session was already closed by the meter");
                Err(ProtocolError::ResponseTimeout.into())
            }
            result => Ok(unit(result)),
        }
    }

    /// Abort the session.
    ///
    /// The baud rate is reset to the default afterwards, even if the
    /// request failed.
    pub async fn terminate(&mut self) -> Result<()> {
        let result = self.call(Request::Terminate).await;
        let reset = self.switch_baud_rate(DEFAULT_BAUD_RATE).await;
        self.user_id = 0;
        match (result, reset) {
            (Ok(result), Ok(())) => Ok(unit(result)),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), reset) => {
                if let Err(reset_err) = reset {
                    log::warn!("Failed to reset baud rate: {reset_err}");
                }
                Err(err)
            }
        }
    }

    pub async fn logoff(&mut self) -> Result<()> {
        let result = self.call(Request::Logoff).await?;
        if result.is_ok() {
            self.user_id = 0;
        }
        Ok(unit(result))
    }

    async fn read(&mut self, request: Request<'_>) -> Result<Bytes> {
        self.call(request).await.map(|result| {
            result.map(|rsp| match rsp {
                Response::Read(data) => data,
                _ => unreachable!("call() should reject mismatching responses"),
            })
        })
    }

    pub async fn full_read(&mut self, table: TableId) -> Result<Bytes> {
        self.read(Request::FullRead(table)).await
    }

    pub async fn offset_read(&mut self, table: TableId, offset: i32, count: u16) -> Result<Bytes> {
        self.read(Request::OffsetRead {
            table,
            offset,
            count,
        })
        .await
    }

    pub async fn full_write(&mut self, table: TableId, data: &[u8]) -> Result<()> {
        self.call(Request::FullWrite {
            table,
            data: Cow::Borrowed(data),
        })
        .await
        .map(unit)
    }

    pub async fn offset_write(&mut self, table: TableId, offset: i32, data: &[u8]) -> Result<()> {
        self.call(Request::OffsetWrite {
            table,
            offset,
            data: Cow::Borrowed(data),
        })
        .await
        .map(unit)
    }

    /// Partial reads by index are not supported.
    pub async fn index_read(
        &mut self,
        _table: TableId,
        _index: &[u16],
        _count: u16,
    ) -> Result<Bytes> {
        Err(Error::NotImplemented("index read"))
    }

    /// Partial writes by index are not supported.
    pub async fn index_write(
        &mut self,
        _table: TableId,
        _index: &[u16],
        _data: &[u8],
    ) -> Result<()> {
        Err(Error::NotImplemented("index write"))
    }

    /// Propose new datalink timing parameters and apply the ones the meter
    /// answers with.
    pub async fn timing_setup(&mut self, timing: Timing) -> Result<Timing> {
        let result = self.call(Request::TimingSetup(timing)).await?;
        let timing = match result {
            Ok(Response::TimingSetup(timing)) => timing,
            Ok(_) => unreachable!("call() should reject mismatching responses"),
            Err(outcome) => return Ok(Err(outcome)),
        };
        let state = self.link.state_mut();
        state.channel_traffic_timeout = Duration::from_secs(timing.channel_traffic_timeout.into());
        state.inter_character_timeout = Duration::from_secs(timing.inter_character_timeout.into());
        state.response_timeout = Duration::from_secs(timing.response_timeout.into());
        state.retries = timing.retries;
        log::debug!("Applied {timing:?}");
        Ok(Ok(timing))
    }
}

#[async_trait]
impl<T: Transport> TableAccess for Application<T> {
    async fn full_read(&mut self, table: TableId) -> Result<Bytes> {
        Application::full_read(self, table).await
    }

    async fn offset_read(&mut self, table: TableId, offset: i32, count: u16) -> Result<Bytes> {
        Application::offset_read(self, table, offset, count).await
    }

    async fn full_write(&mut self, table: TableId, data: &[u8]) -> Result<()> {
        Application::full_write(self, table, data).await
    }

    async fn offset_write(&mut self, table: TableId, offset: i32, data: &[u8]) -> Result<()> {
        Application::offset_write(self, table, offset, data).await
    }
}
