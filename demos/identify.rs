// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identify a meter on an optical probe and read its general configuration

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tokio_psem::prelude::*;

    env_logger::init();

    let tty_path = "/dev/ttyUSB0";
    let transport = SerialTransport::open(tty_path, 9600)?;

    let mut session = Session::new(transport);
    let identification = session.identify().await??;
    println!("Meter speaks C12.18 version {}.{}", identification.version, identification.revision);

    let negotiated = session.negotiate(512, 1, 19_200).await??;
    println!("Negotiated {negotiated:?}");

    session.logon("psem", 2).await??;
    session.security("").await??;

    println!("Reading the general configuration table");
    match session.full_read(0).await? {
        Ok(table) => println!("Table 0: {:02X?}", &table[..]),
        Err(outcome) => println!("Meter refused to read table 0: {outcome}"),
    }

    session.logoff().await??;
    session.terminate().await??;

    println!("Statistics: {:?}", session.statistics().snapshot());
    session.close().await?;

    Ok(())
}
