// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Meter sessions with automatic keep-alive.
//!
//! A meter drops a session after a period without traffic. While a user is
//! logged on, the session issues a wait request whenever the caller stays
//! idle for longer than the configured interval. Foreground calls and
//! keep-alive requests never overlap.

use std::{
    io,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{watch, Mutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    application::{Application, TableAccess},
    bytes::Bytes,
    codec::wait_seconds,
    datalink::{LinkState, ProtocolVariant},
    frame::{Identification, Negotiated, TableId, Timing},
    stats::Statistics,
    transport::Transport,
    Result,
};

#[cfg(feature = "sync")]
pub mod sync;

/// Keep-alive parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Idle time after which a wait request is issued.
    pub interval: Duration,
    /// Seconds requested by each automatic wait.
    pub max_wait_time: u8,
    /// Subtracted from a granted wait period to schedule the next request.
    pub safety_margin: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait_time: u8::MAX,
            safety_margin: Duration::from_secs(2),
        }
    }
}

impl KeepAliveConfig {
    /// The interval after the meter granted a wait of `seconds`.
    fn stretched(&self, seconds: u8) -> Duration {
        Duration::from_secs(wait_seconds(seconds).into())
            .saturating_sub(self.safety_margin)
            .max(self.interval)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub variant: ProtocolVariant,
    pub keep_alive: KeepAliveConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeepAliveState {
    armed: bool,
    paused: bool,
    interval: Duration,
}

impl KeepAliveState {
    const fn is_running(self) -> bool {
        self.armed && !self.paused
    }
}

#[derive(Debug)]
struct KeepAlive {
    state: watch::Sender<KeepAliveState>,
    config: KeepAliveConfig,
}

impl KeepAlive {
    fn new(config: KeepAliveConfig) -> Self {
        let (state, _) = watch::channel(KeepAliveState {
            armed: false,
            paused: false,
            interval: config.interval,
        });
        Self { state, config }
    }

    fn arm(&self) {
        log::debug!("Keep-alive armed");
        self.state.send_modify(|state| {
            state.armed = true;
            state.interval = self.config.interval;
        });
    }

    fn disarm(&self) {
        self.state.send_if_modified(|state| {
            let was_armed = state.armed;
            state.armed = false;
            was_armed
        });
    }

    fn pause(&self) {
        self.state.send_modify(|state| state.paused = true);
    }

    fn resume(&self) {
        self.state.send_modify(|state| {
            state.paused = false;
            state.interval = self.config.interval;
        });
    }

    fn stretch(&self, seconds: u8) {
        let interval = self.config.stretched(seconds);
        self.state.send_modify(|state| state.interval = interval);
    }

    fn current(&self) -> KeepAliveState {
        *self.state.borrow()
    }
}

/// Resumes the keep-alive when a foreground call ends, however it ends.
struct Paused<'a>(&'a KeepAlive);

impl Drop for Paused<'_> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

/// Exclusive access to the application layer for a foreground call.
struct Foreground<'a, T> {
    app: MutexGuard<'a, Application<T>>,
    _paused: Paused<'a>,
}

impl<T> Deref for Foreground<'_, T> {
    type Target = Application<T>;

    fn deref(&self) -> &Self::Target {
        &self.app
    }
}

impl<T> DerefMut for Foreground<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.app
    }
}

async fn run_keep_alive<T: Transport>(
    app: Arc<Mutex<Application<T>>>,
    keep_alive: Arc<KeepAlive>,
    cancel: CancellationToken,
) {
    let mut state = keep_alive.state.subscribe();
    loop {
        let current = *state.borrow_and_update();
        if current.is_running() {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                () = tokio::time::sleep(current.interval) => {}
            }
        } else {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }
        let mut app = app.lock().await;
        // Any foreground call or disarm since the timer started restarts
        // the idle period.
        match state.has_changed() {
            Ok(false) => {}
            Ok(true) => continue,
            Err(_) => return,
        }
        let seconds = keep_alive.config.max_wait_time;
        log::debug!("Keep-alive: wait {seconds} s");
        match app.wait(seconds).await {
            Ok(Ok(())) => keep_alive.stretch(seconds),
            Ok(Err(outcome)) => {
                log::warn!("Keep-alive rejected: {outcome}, disarming");
                keep_alive.disarm();
            }
            Err(err) => {
                log::warn!("Keep-alive failed: {err}, disarming");
                keep_alive.disarm();
            }
        }
    }
}

/// A session with a meter.
///
/// Must be created within a tokio runtime, the keep-alive runs as a
/// background task.
#[derive(Debug)]
pub struct Session<T> {
    app: Arc<Mutex<Application<T>>>,
    keep_alive: Arc<KeepAlive>,
    stats: Arc<Statistics>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> Session<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        let stats = Arc::new(Statistics::new());
        let app = Arc::new(Mutex::new(Application::new(
            transport,
            config.variant,
            Arc::clone(&stats),
        )));
        let keep_alive = Arc::new(KeepAlive::new(config.keep_alive));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_keep_alive(
            Arc::clone(&app),
            Arc::clone(&keep_alive),
            cancel.clone(),
        ));
        Self {
            app,
            keep_alive,
            stats,
            cancel,
            task: Some(task),
        }
    }

    /// Stop the keep-alive and hand back the transport.
    pub async fn close(mut self) -> io::Result<T> {
        self.cancel.cancel();
        let task = self.task.take();
        let app = Arc::clone(&self.app);
        drop(self);
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::warn!("Keep-alive task failed: {err}");
            }
        }
        Arc::try_unwrap(app)
            .map(|app| app.into_inner().into_transport())
            .map_err(|_| io::Error::other("session is still in use"))
    }
}

impl<T> Session<T> {
    pub fn statistics(&self) -> Arc<Statistics> {
        Arc::clone(&self.stats)
    }

    pub fn is_keep_alive_armed(&self) -> bool {
        self.keep_alive.current().armed
    }

    /// The idle time after which the next keep-alive request is due.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive.current().interval
    }

    async fn foreground(&self) -> Foreground<'_, T> {
        self.keep_alive.pause();
        let paused = Paused(&self.keep_alive);
        Foreground {
            app: self.app.lock().await,
            _paused: paused,
        }
    }

    /// A copy of the live datalink parameters.
    pub async fn link_state(&self) -> LinkState {
        self.app.lock().await.link_state().clone()
    }

    pub async fn packet_size(&self) -> u16 {
        self.app.lock().await.link_state().max_packet_size
    }

    pub async fn baud_rate(&self) -> u32 {
        self.app.lock().await.link_state().baud_rate
    }

    pub async fn user_id(&self) -> u16 {
        self.app.lock().await.user_id()
    }

    pub async fn identity(&self) -> u8 {
        self.app.lock().await.link_state().identity
    }

    pub async fn channel_traffic_timeout(&self) -> Duration {
        self.app.lock().await.link_state().channel_traffic_timeout
    }
}

impl<T: Transport> Session<T> {
    pub async fn identify(&mut self) -> Result<Identification> {
        self.foreground().await.identify().await
    }

    pub async fn negotiate(
        &mut self,
        packet_size: u16,
        max_packets: u8,
        max_baud_rate: u32,
    ) -> Result<Negotiated> {
        self.foreground()
            .await
            .negotiate(packet_size, max_packets, max_baud_rate)
            .await
    }

    /// Log on and start the keep-alive.
    pub async fn logon(&mut self, user: &str, user_id: u16) -> Result<()> {
        let result = self.foreground().await.logon(user, user_id).await;
        if matches!(result, Ok(Ok(()))) {
            self.keep_alive.arm();
        }
        result
    }

    pub async fn security(&mut self, password: &str) -> Result<()> {
        self.foreground().await.security(password).await
    }

    /// Ask the meter to wait. The next keep-alive is postponed until
    /// shortly before the granted period ends.
    pub async fn wait(&mut self, seconds: u8) -> Result<()> {
        let result = self.foreground().await.wait(seconds).await;
        if matches!(result, Ok(Ok(()))) && self.keep_alive.current().armed {
            self.keep_alive.stretch(seconds);
        }
        result
    }

    /// Stop the keep-alive and abort the session.
    pub async fn terminate(&mut self) -> Result<()> {
        self.keep_alive.disarm();
        self.foreground().await.terminate().await
    }

    /// Stop the keep-alive and log off.
    pub async fn logoff(&mut self) -> Result<()> {
        self.keep_alive.disarm();
        self.foreground().await.logoff().await
    }

    pub async fn full_read(&mut self, table: TableId) -> Result<Bytes> {
        self.foreground().await.full_read(table).await
    }

    pub async fn offset_read(&mut self, table: TableId, offset: i32, count: u16) -> Result<Bytes> {
        self.foreground()
            .await
            .offset_read(table, offset, count)
            .await
    }

    pub async fn full_write(&mut self, table: TableId, data: &[u8]) -> Result<()> {
        self.foreground().await.full_write(table, data).await
    }

    pub async fn offset_write(&mut self, table: TableId, offset: i32, data: &[u8]) -> Result<()> {
        self.foreground()
            .await
            .offset_write(table, offset, data)
            .await
    }

    pub async fn index_read(&mut self, table: TableId, index: &[u16], count: u16) -> Result<Bytes> {
        self.foreground()
            .await
            .index_read(table, index, count)
            .await
    }

    pub async fn index_write(&mut self, table: TableId, index: &[u16], data: &[u8]) -> Result<()> {
        self.foreground()
            .await
            .index_write(table, index, data)
            .await
    }

    pub async fn timing_setup(&mut self, timing: Timing) -> Result<Timing> {
        self.foreground().await.timing_setup(timing).await
    }
}

impl<T> Drop for Session<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl<T: Transport> TableAccess for Session<T> {
    async fn full_read(&mut self, table: TableId) -> Result<Bytes> {
        Session::full_read(self, table).await
    }

    async fn offset_read(&mut self, table: TableId, offset: i32, count: u16) -> Result<Bytes> {
        Session::offset_read(self, table, offset, count).await
    }

    async fn full_write(&mut self, table: TableId, data: &[u8]) -> Result<()> {
        Session::full_write(self, table, data).await
    }

    async fn offset_write(&mut self, table: TableId, offset: i32, data: &[u8]) -> Result<()> {
        Session::offset_write(self, table, offset, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::ACK,
        transport::mock::{response, MockTransport, Recorded},
        Outcome,
    };

    fn answer(toggle: bool, body: &[u8]) -> Vec<u8> {
        let mut reply = vec![ACK];
        reply.extend(response(toggle, body));
        reply
    }

    fn services(recorded: &std::sync::Mutex<Recorded>) -> Vec<u8> {
        recorded
            .lock()
            .unwrap()
            .packets()
            .iter()
            .map(|frame| frame[6])
            .collect()
    }

    async fn idle(seconds: u64) {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_keep_alive_before_logon() {
        let transport = MockTransport::new().reply(answer(true, &[0x00, 0x00, 0x01, 0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.identify().await.unwrap().unwrap();
        idle(60).await;

        assert!(!session.is_keep_alive_armed());
        assert_eq!(services(&recorded), vec![0x20]);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_after_idle_interval() {
        // Given
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        // When
        session.logon("reader", 2).await.unwrap().unwrap();
        idle(4).await;
        let before_interval = services(&recorded);
        idle(2).await;

        // Then
        assert_eq!(before_interval, vec![0x50]);
        assert_eq!(services(&recorded), vec![0x50, 0x70]);
        let packets = recorded.lock().unwrap().packets();
        assert_eq!(packets[1][7], 0xFF);
        assert!(session.is_keep_alive_armed());
        assert_eq!(session.keep_alive_interval(), Duration::from_secs(253));
        assert_eq!(session.statistics().snapshot().outcome(Outcome::Ok), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keep_alive_disarms() {
        let transport = MockTransport::new().reply(answer(true, &[0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.logon("reader", 2).await.unwrap().unwrap();
        idle(20).await;

        assert!(!session.is_keep_alive_armed());
        assert_eq!(services(&recorded), vec![0x50, 0x70, 0x70, 0x70, 0x70]);

        idle(1_000).await;
        assert_eq!(recorded.lock().unwrap().packets().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_keep_alive_disarms() {
        // Given
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x01]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        // When
        session.logon("reader", 2).await.unwrap().unwrap();
        idle(6).await;

        // Then
        assert!(!session.is_keep_alive_armed());
        assert_eq!(services(&recorded), vec![0x50, 0x70]);
        idle(1_000).await;
        assert_eq!(services(&recorded), vec![0x50, 0x70]);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_disarms_when_meter_dropped_session() {
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x0A]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.logon("reader", 2).await.unwrap().unwrap();
        idle(6).await;

        assert!(!session.is_keep_alive_armed());
        assert_eq!(services(&recorded), vec![0x50, 0x70]);
        let stats = session.statistics().snapshot();
        assert_eq!(stats.outcome(Outcome::InvalidServiceSequenceState), 1);
        idle(1_000).await;
        assert_eq!(services(&recorded), vec![0x50, 0x70]);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_never_follows_a_call_immediately() {
        // Given
        let mut transport = MockTransport::new();
        for i in 0..50 {
            transport = transport.reply(answer(i % 2 == 0, &[0x00]));
        }
        let recorded = transport.recorded();
        let mut session = Session::new(transport);
        session.logon("reader", 2).await.unwrap().unwrap();

        for _ in 0..20 {
            // When
            idle(5).await;
            session.full_write(1, &[0x01]).await.unwrap().unwrap();
            let after_call = services(&recorded).len();
            tokio::time::sleep(Duration::from_millis(1)).await;

            // Then
            assert_eq!(services(&recorded).len(), after_call);
            assert!(session.is_keep_alive_armed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn foreground_calls_postpone_keep_alive() {
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x00, 0x00, 0x01, 0x2A, 0xD6]))
            .reply(answer(true, &[0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.logon("reader", 2).await.unwrap().unwrap();
        idle(3).await;
        let data = session.full_read(1).await.unwrap().unwrap();
        assert_eq!(data, &[0x2A][..]);
        idle(3).await;
        assert_eq!(services(&recorded), vec![0x50, 0x30]);
        idle(3).await;

        assert_eq!(services(&recorded), vec![0x50, 0x30, 0x70]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_foreground_call_resumes_keep_alive() {
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x03]))
            .reply(answer(true, &[0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.logon("reader", 2).await.unwrap().unwrap();
        let result = session.full_write(1, &[0x01]).await.unwrap();
        assert_eq!(result, Err(Outcome::InsufficientSecurityClearance));
        idle(6).await;

        assert_eq!(services(&recorded), vec![0x50, 0x40, 0x70]);
    }

    #[tokio::test(start_paused = true)]
    async fn logoff_disarms_keep_alive() {
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.logon("reader", 2).await.unwrap().unwrap();
        assert!(session.is_keep_alive_armed());
        assert_eq!(session.user_id().await, 2);
        session.logoff().await.unwrap().unwrap();
        idle(60).await;

        assert!(!session.is_keep_alive_armed());
        assert_eq!(services(&recorded), vec![0x50, 0x52]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_wait_stretches_interval() {
        let transport = MockTransport::new()
            .reply(answer(true, &[0x00]))
            .reply(answer(false, &[0x00]))
            .reply(answer(true, &[0x00]));
        let recorded = transport.recorded();
        let mut session = Session::new(transport);

        session.logon("reader", 2).await.unwrap().unwrap();
        session.wait(60).await.unwrap().unwrap();
        assert_eq!(session.keep_alive_interval(), Duration::from_secs(58));

        idle(57).await;
        assert_eq!(services(&recorded), vec![0x50, 0x70]);
        idle(2).await;
        assert_eq!(services(&recorded), vec![0x50, 0x70, 0x70]);
    }

    #[tokio::test(start_paused = true)]
    async fn accessors_and_close() {
        let transport = MockTransport::new().with_max_packet_size(512);
        let session = Session::new(transport);

        assert_eq!(session.packet_size().await, 64);
        assert_eq!(session.baud_rate().await, 9_600);
        assert_eq!(session.identity().await, 0);
        assert_eq!(
            session.channel_traffic_timeout().await,
            Duration::from_secs(6)
        );

        let transport = session.close().await.unwrap();
        assert_eq!(transport.max_supported_packet_size(), 512);
    }
}
