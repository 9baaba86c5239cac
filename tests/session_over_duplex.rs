// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

mod meter;

use std::collections::HashMap;

use tokio_psem::{prelude::*, Request};

use meter::Faults;

fn tables() -> HashMap<TableId, Vec<u8>> {
    let mut tables = HashMap::new();
    tables.insert(0, b"ITRN\x01\x02CENTRON ".to_vec());
    tables.insert(2062, (0..=255).cycle().take(600).collect());
    tables
}

#[tokio::test]
async fn complete_session() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    // Given
    let (transport, requests, _meter) = meter::spawn(tables(), Faults::default());
    let mut session = Session::new(transport);

    // When
    let identification = session.identify().await??;
    let negotiated = session.negotiate(256, 1, 19_200).await??;
    session.logon("reader", 2).await??;
    session.security("secret").await??;
    let table = session.full_read(0).await??;
    session.logoff().await??;
    session.terminate().await??;

    // Then
    assert_eq!(identification.version, 1);
    assert_eq!(negotiated.packet_size, 256);
    assert_eq!(negotiated.baud_rate, Some(BaudRate::B19200));
    assert_eq!(session.packet_size().await, 256);
    assert_eq!(session.baud_rate().await, 9_600);
    assert_eq!(&table[..], b"ITRN\x01\x02CENTRON ");
    assert!(!session.is_keep_alive_armed());

    let requests = requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 7);
    assert!(matches!(
        requests[1],
        Request::Negotiate {
            packet_size: 256,
            max_packets: 1,
            max_baud_rate: 19_200
        }
    ));
    assert!(matches!(&requests[2], Request::Logon { user_id: 2, user } if user == "reader"));

    let stats = session.statistics().snapshot();
    assert_eq!(stats.outcome(Outcome::Ok), 7);
    assert_eq!(stats.naks_sent + stats.naks_received + stats.timeouts, 0);
    Ok(())
}

#[tokio::test]
async fn read_table_spanning_multiple_packets() -> anyhow::Result<()> {
    let (transport, _, _meter) = meter::spawn(tables(), Faults::default());
    let mut session = Session::new(transport);

    let table = session.full_read(2062).await??;
    let part = session.offset_read(2062, 250, 10).await??;

    let expected: Vec<u8> = (0..=255).cycle().take(600).collect();
    assert_eq!(&table[..], &expected[..]);
    assert_eq!(&part[..], &expected[250..260]);
    Ok(())
}

#[tokio::test]
async fn write_then_read_back() -> anyhow::Result<()> {
    let (transport, _, _meter) = meter::spawn(HashMap::new(), Faults::default());
    let mut session = Session::new(transport);
    let data: Vec<u8> = (0..300u16).map(|i| (i * 7) as u8).collect();

    session.full_write(64, &data).await??;
    let read = session.full_read(64).await??;
    assert_eq!(&read[..], &data[..]);

    session.offset_write(64, 10, &[0xAA, 0xBB]).await??;
    let read = session.offset_read(64, 9, 4).await??;
    assert_eq!(&read[..], &[data[9], 0xAA, 0xBB, data[12]]);
    Ok(())
}

#[tokio::test]
async fn table_access_trait() -> anyhow::Result<()> {
    async fn copy_table(
        access: &mut impl TableAccess,
        from: TableId,
        to: TableId,
    ) -> anyhow::Result<()> {
        let data = access.full_read(from).await??;
        access.full_write(to, &data).await??;
        Ok(())
    }

    let (transport, _, _meter) = meter::spawn(tables(), Faults::default());
    let mut session = Session::new(transport);

    copy_table(&mut session, 0, 1).await?;

    let copy = session.full_read(1).await??;
    assert_eq!(&copy[..], b"ITRN\x01\x02CENTRON ");
    Ok(())
}

#[tokio::test]
async fn meter_answers_with_outcome() -> anyhow::Result<()> {
    let (transport, _, _meter) = meter::spawn(tables(), Faults::default());
    let mut session = Session::new(transport);

    let missing = session.full_read(9).await?;
    let wrong_password = session.security("guess").await?;

    assert_eq!(missing, Err(Outcome::OperationNotPossible));
    assert_eq!(wrong_password, Err(Outcome::Err));
    let stats = session.statistics().snapshot();
    assert_eq!(stats.outcome(Outcome::OperationNotPossible), 1);
    assert_eq!(stats.outcome(Outcome::Err), 1);
    Ok(())
}

#[tokio::test]
async fn resend_rejected_packets() -> anyhow::Result<()> {
    let faults = Faults {
        naks: 2,
        ..Faults::default()
    };
    let (transport, _, _meter) = meter::spawn(tables(), faults);
    let mut session = Session::new(transport);

    session.identify().await??;

    assert_eq!(session.statistics().snapshot().naks_received, 2);
    Ok(())
}

#[tokio::test]
async fn reject_corrupted_response() -> anyhow::Result<()> {
    let faults = Faults {
        corrupt_first_response: true,
        ..Faults::default()
    };
    let (transport, _, _meter) = meter::spawn(tables(), faults);
    let mut session = Session::new(transport);

    let table = session.full_read(0).await??;

    assert_eq!(&table[..], b"ITRN\x01\x02CENTRON ");
    let stats = session.statistics().snapshot();
    assert_eq!(stats.naks_sent, 1);
    assert_eq!(stats.outcome(Outcome::Ok), 1);
    Ok(())
}

#[tokio::test]
async fn index_read_is_not_implemented() {
    let (transport, requests, _meter) = meter::spawn(tables(), Faults::default());
    let mut session = Session::new(transport);

    let err = session.index_read(0, &[1], 4).await.unwrap_err();

    assert!(matches!(err, Error::NotImplemented(_)));
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn close_returns_transport() {
    let (transport, _, _meter) = meter::spawn(tables(), Faults::default());
    let session = Session::new(transport.with_max_packet_size(2048));

    let transport = session.close().await.unwrap();

    assert!(transport.is_open());
    assert_eq!(transport.max_supported_packet_size(), 2048);
}
