// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous session access

use std::{io, sync::Arc, time::Duration};

use tokio::runtime::Runtime;

use super::{Session as AsyncSession, SessionConfig};
use crate::{
    bytes::Bytes,
    datalink::LinkState,
    frame::{Identification, Negotiated, TableId, Timing},
    stats::Statistics,
    transport::Transport,
    Result,
};

/// A blocking meter session.
///
/// Owns a multi-threaded runtime, so the keep-alive keeps running
/// between two calls.
#[derive(Debug)]
pub struct Session<T> {
    session: AsyncSession<T>,
    runtime: Runtime,
}

impl<T: Transport + 'static> Session<T> {
    pub fn new(transport: T) -> io::Result<Self> {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let session = {
            let _guard = runtime.enter();
            AsyncSession::with_config(transport, config)
        };
        Ok(Self { session, runtime })
    }

    /// Stop the keep-alive and hand back the transport.
    pub fn close(self) -> io::Result<T> {
        let Self { session, runtime } = self;
        runtime.block_on(session.close())
    }

    pub fn identify(&mut self) -> Result<Identification> {
        self.runtime.block_on(self.session.identify())
    }

    pub fn negotiate(
        &mut self,
        packet_size: u16,
        max_packets: u8,
        max_baud_rate: u32,
    ) -> Result<Negotiated> {
        self.runtime
            .block_on(self.session.negotiate(packet_size, max_packets, max_baud_rate))
    }

    pub fn logon(&mut self, user: &str, user_id: u16) -> Result<()> {
        self.runtime.block_on(self.session.logon(user, user_id))
    }

    pub fn security(&mut self, password: &str) -> Result<()> {
        self.runtime.block_on(self.session.security(password))
    }

    pub fn wait(&mut self, seconds: u8) -> Result<()> {
        self.runtime.block_on(self.session.wait(seconds))
    }

    pub fn terminate(&mut self) -> Result<()> {
        self.runtime.block_on(self.session.terminate())
    }

    pub fn logoff(&mut self) -> Result<()> {
        self.runtime.block_on(self.session.logoff())
    }

    pub fn full_read(&mut self, table: TableId) -> Result<Bytes> {
        self.runtime.block_on(self.session.full_read(table))
    }

    pub fn offset_read(&mut self, table: TableId, offset: i32, count: u16) -> Result<Bytes> {
        self.runtime
            .block_on(self.session.offset_read(table, offset, count))
    }

    pub fn full_write(&mut self, table: TableId, data: &[u8]) -> Result<()> {
        self.runtime.block_on(self.session.full_write(table, data))
    }

    pub fn offset_write(&mut self, table: TableId, offset: i32, data: &[u8]) -> Result<()> {
        self.runtime
            .block_on(self.session.offset_write(table, offset, data))
    }

    pub fn index_read(&mut self, table: TableId, index: &[u16], count: u16) -> Result<Bytes> {
        self.runtime
            .block_on(self.session.index_read(table, index, count))
    }

    pub fn index_write(&mut self, table: TableId, index: &[u16], data: &[u8]) -> Result<()> {
        self.runtime
            .block_on(self.session.index_write(table, index, data))
    }

    pub fn timing_setup(&mut self, timing: Timing) -> Result<Timing> {
        self.runtime.block_on(self.session.timing_setup(timing))
    }

    pub fn packet_size(&self) -> u16 {
        self.runtime.block_on(self.session.packet_size())
    }

    pub fn baud_rate(&self) -> u32 {
        self.runtime.block_on(self.session.baud_rate())
    }

    pub fn identity(&self) -> u8 {
        self.runtime.block_on(self.session.identity())
    }

    /// A copy of the live datalink parameters.
    pub fn link_state(&self) -> LinkState {
        self.runtime.block_on(self.session.link_state())
    }

    pub fn user_id(&self) -> u16 {
        self.runtime.block_on(self.session.user_id())
    }

    pub fn channel_traffic_timeout(&self) -> Duration {
        self.runtime
            .block_on(self.session.channel_traffic_timeout())
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        self.session.statistics()
    }

    pub fn is_keep_alive_armed(&self) -> bool {
        self.session.is_keep_alive_armed()
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.session.keep_alive_interval()
    }
}
