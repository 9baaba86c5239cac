// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous table read example

fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tokio_psem::prelude::*;

    let tty_path = "/dev/ttyUSB0";
    let transport = SerialTransport::open(tty_path, 9600)?;

    let mut session = sync::Session::new(transport)?;
    session.identify()??;
    session.logon("psem", 2)??;
    session.security("")??;

    println!("Reading the current register data");
    let table = session.offset_read(23, 0, 32)??;
    println!("Table 23: {:02X?}", &table[..]);

    session.terminate()??;
    session.close()?;

    Ok(())
}
