// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte transports below the datalink layer.

use std::{
    fmt,
    io::{self, Error, ErrorKind},
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Default baud rate of an optical port before negotiation.
pub const DEFAULT_BAUD_RATE: u32 = 9_600;

/// Largest packet a transport accepts unless configured otherwise.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 8_192;

/// The narrow byte stream interface the protocol layers depend on.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Write all bytes.
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read at most `buf.len()` bytes.
    ///
    /// Returns `0` if nothing arrived within `timeout`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn is_open(&self) -> bool;

    fn baud_rate(&self) -> u32;

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;

    /// The largest packet size this transport can handle, an upper bound
    /// for negotiation.
    fn max_supported_packet_size(&self) -> u16;

    /// Discard everything that is already waiting in the input.
    async fn clear_input(&mut self) -> io::Result<()> {
        let mut buf = [0; 64];
        let mut discarded = 0;
        while self.is_open() {
            let count = self.read(&mut buf, Duration::ZERO).await?;
            if count == 0 {
                break;
            }
            discarded += count;
        }
        if discarded > 0 {
            log::trace!("Discarded {discarded} input bytes");
        }
        Ok(())
    }
}

async fn read_stream<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    if buf.is_empty() {
        return Ok(0);
    }
    match tokio::time::timeout(timeout, stream.read(buf)).await {
        Ok(Ok(0)) => Err(Error::from(ErrorKind::UnexpectedEof)),
        Ok(result) => result,
        Err(_elapsed) => Ok(0),
    }
}

/// A transport over any asynchronous byte stream, e.g. a TCP connection
/// to a serial device server or an in-memory pipe.
///
/// The baud rate is only recorded, the stream is not affected by it.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    open: bool,
    baud_rate: u32,
    max_packet_size: u16,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            open: true,
            baud_rate: DEFAULT_BAUD_RATE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_packet_size(mut self, max_packet_size: u16) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug,
{
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.open {
            return Err(Error::from(ErrorKind::NotConnected));
        }
        let result = async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        }
        .await;
        if result.is_err() {
            self.open = false;
        }
        result
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !self.open {
            return Err(Error::from(ErrorKind::NotConnected));
        }
        let result = read_stream(&mut self.stream, buf, timeout).await;
        if result.is_err() {
            self.open = false;
        }
        result
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn max_supported_packet_size(&self) -> u16 {
        self.max_packet_size
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use std::{io, path::Path, time::Duration};

    use async_trait::async_trait;
    use tokio_serial::{SerialPort as _, SerialStream};

    use super::{StreamTransport, Transport};

    /// A transport over a serial port, typically an optical probe.
    #[derive(Debug)]
    pub struct SerialTransport {
        inner: StreamTransport<SerialStream>,
    }

    impl SerialTransport {
        /// Open the serial port at `path` with the given initial baud rate.
        pub fn open(path: impl AsRef<Path>, baud_rate: u32) -> io::Result<Self> {
            let builder = tokio_serial::new(path.as_ref().to_string_lossy(), baud_rate);
            let serial = SerialStream::open(&builder)?;
            Ok(Self::new(serial))
        }

        /// Set up a transport based on a pre-configured serial stream.
        #[must_use]
        pub fn new(serial: SerialStream) -> Self {
            let mut inner = StreamTransport::new(serial);
            inner.baud_rate = inner.stream.baud_rate().unwrap_or(super::DEFAULT_BAUD_RATE);
            Self { inner }
        }

        #[must_use]
        pub fn with_max_packet_size(self, max_packet_size: u16) -> Self {
            Self {
                inner: self.inner.with_max_packet_size(max_packet_size),
            }
        }

        pub fn into_inner(self) -> SerialStream {
            self.inner.into_inner()
        }
    }

    #[async_trait]
    impl Transport for SerialTransport {
        async fn send(&mut self, data: &[u8]) -> io::Result<()> {
            self.inner.send(data).await
        }

        async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.inner.read(buf, timeout).await
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn baud_rate(&self) -> u32 {
            self.inner.baud_rate
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
            self.inner.stream.set_baud_rate(baud_rate)?;
            log::debug!("Switched serial port to {baud_rate} Bd");
            self.inner.baud_rate = baud_rate;
            Ok(())
        }

        fn max_supported_packet_size(&self) -> u16 {
            self.inner.max_packet_size
        }
    }
}

/// A scripted far end for unit tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::VecDeque,
        io,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{Transport, DEFAULT_BAUD_RATE, DEFAULT_MAX_PACKET_SIZE};
    use crate::{
        bytes::{Bytes, BytesMut},
        codec::{encode_packet, STP},
        frame::{Control, Packet},
    };

    /// Everything the code under test did with the transport.
    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub(crate) sent: Vec<Vec<u8>>,
        pub(crate) baud_rates: Vec<u32>,
    }

    impl Recorded {
        /// The written packets, without single ACK/NAK bytes.
        pub(crate) fn packets(&self) -> Vec<Vec<u8>> {
            self.sent
                .iter()
                .filter(|frame| frame.first() == Some(&STP))
                .cloned()
                .collect()
        }

        pub(crate) fn control_bytes(&self) -> Vec<u8> {
            self.sent
                .iter()
                .filter(|frame| frame.len() == 1)
                .map(|frame| frame[0])
                .collect()
        }
    }

    /// Each written packet releases the next scripted reply into the
    /// input. Reading an empty input waits for the full timeout.
    #[derive(Debug)]
    pub(crate) struct MockTransport {
        replies: VecDeque<Vec<u8>>,
        input: VecDeque<u8>,
        recorded: Arc<Mutex<Recorded>>,
        baud_rate: u32,
        max_packet_size: u16,
        open: bool,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self {
                replies: VecDeque::new(),
                input: VecDeque::new(),
                recorded: Arc::default(),
                baud_rate: DEFAULT_BAUD_RATE,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
                open: true,
            }
        }

        /// Queue the bytes released by the next written packet.
        pub(crate) fn reply(mut self, bytes: impl Into<Vec<u8>>) -> Self {
            self.replies.push_back(bytes.into());
            self
        }

        /// Bytes that are waiting before anything was written.
        pub(crate) fn pending(mut self, bytes: &[u8]) -> Self {
            self.input.extend(bytes);
            self
        }

        pub(crate) fn with_max_packet_size(mut self, max_packet_size: u16) -> Self {
            self.max_packet_size = max_packet_size;
            self
        }

        pub(crate) fn closed(mut self) -> Self {
            self.open = false;
            self
        }

        pub(crate) fn recorded(&self) -> Arc<Mutex<Recorded>> {
            Arc::clone(&self.recorded)
        }
    }

    /// Encode a single packet as the meter would send it.
    pub(crate) fn packet(control: Control, sequence: u8, data: &[u8]) -> Vec<u8> {
        let packet = Packet {
            identity: 0,
            control,
            sequence,
            data: Bytes::copy_from_slice(data),
        };
        let mut buf = BytesMut::new();
        encode_packet(&packet, &mut buf).unwrap();
        buf.to_vec()
    }

    /// A single packet response with the given toggle bit.
    pub(crate) fn response(toggle: bool, body: &[u8]) -> Vec<u8> {
        packet(Control::new(false, false, toggle), 0, body)
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, data: &[u8]) -> io::Result<()> {
            if !self.open {
                return Err(io::ErrorKind::NotConnected.into());
            }
            self.recorded.lock().unwrap().sent.push(data.to_vec());
            if data.first() == Some(&STP) {
                if let Some(reply) = self.replies.pop_front() {
                    self.input.extend(reply);
                }
            }
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            if self.input.is_empty() {
                tokio::time::sleep(timeout).await;
                return Ok(0);
            }
            let count = buf.len().min(self.input.len());
            for (dst, src) in buf.iter_mut().zip(self.input.drain(..count)) {
                *dst = src;
            }
            Ok(count)
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn baud_rate(&self) -> u32 {
            self.baud_rate
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
            self.recorded.lock().unwrap().baud_rates.push(baud_rate);
            self.baud_rate = baud_rate;
            Ok(())
        }

        fn max_supported_packet_size(&self) -> u16 {
            self.max_packet_size
        }
    }
}
