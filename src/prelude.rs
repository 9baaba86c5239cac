// SPDX-FileCopyrightText: Copyright (c) 2017-2023 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types and traits

///////////////////////////////////////////////////////////////////
/// Modules
///////////////////////////////////////////////////////////////////
pub use crate::session;

#[allow(missing_docs)]
#[cfg(feature = "sync")]
pub mod sync {
    pub use crate::session::sync::*;
}

///////////////////////////////////////////////////////////////////
/// Types
///////////////////////////////////////////////////////////////////
pub use crate::{BaudRate, Identification, Negotiated, Outcome, TableId, Timing};
pub use crate::{Error, ProtocolError};

pub use crate::session::{KeepAliveConfig, Session, SessionConfig};
pub use crate::{datalink::ProtocolVariant, stats::StatisticsSnapshot};

#[cfg(feature = "serial")]
pub use crate::transport::SerialTransport;
pub use crate::transport::StreamTransport;

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::application::TableAccess;
pub use crate::transport::Transport;
