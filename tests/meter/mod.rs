// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A simulated meter on the far end of an in-memory pipe.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream},
    task::JoinHandle,
};
use tokio_psem::{
    bytes::{Bytes, BytesMut},
    codec::{
        decode_packet, decode_request, encode_packet, encode_response, packet::HEADER_LEN,
        segment, ReceivedPacket, ACK, NAK, STP,
    },
    transport::StreamTransport,
    BaudRate, Control, Identification, Negotiated, Outcome, Packet, Request, Response, TableId,
};

const MAX_PACKET_SIZE: u16 = 1024;

const PASSWORD: &str = "secret";

/// Deviations from a well-behaved meter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    /// Reject this many packets with NAK before accepting them.
    pub naks: usize,
    /// Send the first response packet with a broken CRC.
    pub corrupt_first_response: bool,
}

#[derive(Debug)]
pub struct Meter {
    stream: DuplexStream,
    tables: HashMap<TableId, Vec<u8>>,
    faults: Faults,
    packet_size: u16,
    toggle: bool,
    last_received: Option<(bool, u16)>,
    requests: Arc<Mutex<Vec<Request<'static>>>>,
}

/// Requests the meter has answered.
pub type RequestLog = Arc<Mutex<Vec<Request<'static>>>>;

/// Start a meter with the given tables and connect a transport to it.
pub fn spawn(
    tables: HashMap<TableId, Vec<u8>>,
    faults: Faults,
) -> (StreamTransport<DuplexStream>, RequestLog, JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(4096);
    let requests = RequestLog::default();
    let meter = Meter {
        stream: server,
        tables,
        faults,
        packet_size: 64,
        toggle: false,
        last_received: None,
        requests: Arc::clone(&requests),
    };
    let handle = tokio::spawn(meter.run());
    (StreamTransport::new(client), requests, handle)
}

impl Meter {
    async fn run(mut self) {
        let mut assembly = BytesMut::new();
        while let Some(frame) = self.read_frame().await {
            let Ok(ReceivedPacket { packet, crc }) = decode_packet(&frame) else {
                self.write(&[NAK]).await;
                continue;
            };
            if self.faults.naks > 0 {
                self.faults.naks -= 1;
                self.write(&[NAK]).await;
                continue;
            }
            let id = (packet.control.toggle(), crc);
            self.write(&[ACK]).await;
            if self.last_received == Some(id) {
                continue;
            }
            self.last_received = Some(id);
            if packet.starts_transmission() {
                assembly.clear();
            }
            assembly.extend_from_slice(&packet.data);
            if !packet.is_last() {
                continue;
            }
            let body = assembly.split().freeze();
            let (rsp, packet_size) = self.handle(&body);
            let mut buf = BytesMut::new();
            encode_response(&rsp, &mut buf).unwrap();
            if !self.send(&buf).await {
                return;
            }
            if let Some(packet_size) = packet_size {
                self.packet_size = packet_size;
            }
        }
    }

    fn handle(&mut self, body: &[u8]) -> (Result<Response, Outcome>, Option<u16>) {
        let req = match decode_request(body) {
            Ok(req) => req,
            Err(_) => return (Err(Outcome::ServiceNotSupported), None),
        };
        self.requests.lock().unwrap().push(req.clone());
        let mut packet_size = None;
        let rsp = match req {
            Request::Identify => Ok(Response::Identify(Identification {
                standard: 0,
                version: 1,
                revision: 0,
                features: Bytes::new(),
            })),
            Request::Negotiate {
                packet_size: requested,
                max_packets,
                max_baud_rate,
            } => {
                let granted = requested.min(MAX_PACKET_SIZE);
                packet_size = Some(granted);
                Ok(Response::Negotiate(Negotiated {
                    packet_size: granted,
                    max_packets,
                    baud_rate: BaudRate::offered_up_to(max_baud_rate).first().copied(),
                }))
            }
            Request::Logon { .. } => Ok(Response::Logon),
            Request::Security { password } => {
                if password == PASSWORD {
                    Ok(Response::Security)
                } else {
                    Err(Outcome::Err)
                }
            }
            Request::Wait(_) => Ok(Response::Wait),
            Request::Terminate => Ok(Response::Terminate),
            Request::Logoff => Ok(Response::Logoff),
            Request::FullRead(table) => self
                .tables
                .get(&table)
                .map(|data| Response::Read(Bytes::copy_from_slice(data)))
                .ok_or(Outcome::OperationNotPossible),
            Request::OffsetRead {
                table,
                offset,
                count,
            } => {
                let start = usize::try_from(offset).unwrap();
                let end = start + usize::from(count);
                self.tables
                    .get(&table)
                    .and_then(|data| data.get(start..end))
                    .map(|data| Response::Read(Bytes::copy_from_slice(data)))
                    .ok_or(Outcome::OperationNotPossible)
            }
            Request::FullWrite { table, data } => {
                self.tables.insert(table, data.into_owned());
                Ok(Response::Write)
            }
            Request::OffsetWrite {
                table,
                offset,
                data,
            } => {
                let start = usize::try_from(offset).unwrap();
                let table = self.tables.entry(table).or_default();
                if table.len() < start + data.len() {
                    table.resize(start + data.len(), 0);
                }
                table[start..start + data.len()].copy_from_slice(&data);
                Ok(Response::Write)
            }
            Request::TimingSetup(timing) => Ok(Response::TimingSetup(timing)),
        };
        (rsp, packet_size)
    }

    /// Send a response, returns `false` if the client stopped answering.
    async fn send(&mut self, payload: &[u8]) -> bool {
        let segments = segment(payload, usize::from(self.packet_size), 8).unwrap();
        for segment in segments {
            self.toggle = !self.toggle;
            let packet = Packet {
                identity: 0,
                control: Control::new(segment.multi_packet, segment.first_packet, self.toggle),
                sequence: segment.sequence,
                data: Bytes::copy_from_slice(segment.data),
            };
            let mut frame = BytesMut::new();
            encode_packet(&packet, &mut frame).unwrap();
            let mut acknowledged = false;
            for _ in 0..4 {
                if self.faults.corrupt_first_response {
                    self.faults.corrupt_first_response = false;
                    let mut corrupt = frame.to_vec();
                    let last = corrupt.len() - 1;
                    corrupt[last] ^= 0xFF;
                    self.write(&corrupt).await;
                } else {
                    self.write(&frame).await;
                }
                if self.read_byte(Duration::from_secs(2)).await == Some(ACK) {
                    acknowledged = true;
                    break;
                }
            }
            if !acknowledged {
                return false;
            }
        }
        true
    }

    async fn read_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let mut byte = [0];
            self.stream.read_exact(&mut byte).await.ok()?;
            if byte[0] != STP {
                continue;
            }
            let mut frame = vec![STP; 1 + HEADER_LEN];
            self.stream.read_exact(&mut frame[1..]).await.ok()?;
            let len = usize::from(u16::from_be_bytes([frame[4], frame[5]]));
            frame.resize(1 + HEADER_LEN + len + 2, 0);
            self.stream
                .read_exact(&mut frame[1 + HEADER_LEN..])
                .await
                .ok()?;
            return Some(frame);
        }
    }

    async fn read_byte(&mut self, timeout: Duration) -> Option<u8> {
        let mut byte = [0];
        match tokio::time::timeout(timeout, self.stream.read_exact(&mut byte)).await {
            Ok(Ok(_)) => Some(byte[0]),
            _ => None,
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        // The client may already be gone.
        let _ = self.stream.write_all(bytes).await;
    }
}
