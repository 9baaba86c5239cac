// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A pure [Rust](https://www.rust-lang.org) implementation of the
//! ANSI C12.18 protocol specification for electricity meters (PSEM)
//! based on [tokio](https://tokio.rs).
//!
//! The protocol consists of two layers:
//!
//! - the *datalink* layer that frames, checksums, acknowledges and
//!   reassembles packets, and
//! - the *application* layer that encodes the PSEM services
//!   (identify, negotiate, logon, table reads and writes, ...).
//!
//! A [`Session`](session::Session) ties both layers together and keeps
//! an established session alive while the client is idle.
//!
//! ## Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tokio-psem = "*"
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tokio_psem::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", 9600)?;
//!     let mut session = Session::new(transport);
//!
//!     session.identify().await??;
//!     session.negotiate(256, 1, 9600).await??;
//!     session.logon("reader", 2).await??;
//!
//!     let general_config = session.full_read(0).await??;
//!     println!("Table 0: {general_config:?}");
//!
//!     session.logoff().await??;
//!     session.terminate().await??;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![warn(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude;

pub use bytes;

pub mod application;
pub mod codec;
pub mod datalink;
pub mod session;
pub mod stats;
pub mod transport;

mod error;
pub use self::error::{EncodingError, Error, ProtocolError};

mod frame;
pub use self::frame::*;

/// Specialized [`std::result::Result`] type for PSEM service calls.
///
/// The outer `Result` reports whether the exchange with the meter
/// succeeded at all, the inner `Result` carries the meter's answer.
pub type Result<T> = std::result::Result<std::result::Result<T, Outcome>, Error>;
