//! A byte-stream socket that survives the failure of the transport connection carrying it.
//!
//! Applications see an ordinary connect / read / write / close socket. Behind it, a [Supervisor]
//!  owns one *connection record* per logical connection, detects the death of the transport
//!  connection that currently carries it, opens a replacement, re-synchronizes in-flight data
//!  and resumes delivery - with no loss, duplication or reordering visible to the application.
//!
//! ## Design goals
//!
//! * The transport is pluggable: anything that provides reliable, ordered byte streams while
//!    connected and a clean failure signal (EOF or I/O error) when it breaks. TCP and an
//!    in-process memory transport are part of the crate.
//! * A logical connection is identified by `(initiator id, connection id)` where the initiator id
//!    is a UUID chosen per [Supervisor] and the connection id is a counter local to it. The
//!    identity never changes, no matter how many transport connections carry it over its lifetime.
//! * Only the initiating side reconnects. The accepting side waits passively for the initiator
//!    to re-join.
//! * Each logical connection uses its own transport connection - there is no multiplexing
//!    at this level.
//! * Explicitly *not* in scope: flow control beyond buffering, encryption / authentication,
//!    ordering across logical connections, persistence across process restarts.
//!
//! ## Frame layout
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//!  0: magic number (u32) - 0x52534F4B
//!  4: command kind (u16)
//!  6: total frame length (u32), including this header
//! 10: initiator id (u16 length + UTF-8 bytes of the hyphenated UUID)
//!  *: connection id (u32)
//!  *: command specific fields
//! ```
//!
//! Command specific fields:
//!
//! ```ascii
//! NEW_CONNECTION (1), JOIN_CONNECTION (2), CLOSE_CONNECTION (3):
//!     [no payload]
//! ACKNOWLEDGE (4):
//!     acknowledged command kind (u16)
//!     parameter (u32)
//! DATA (5):
//!     packet id (u32)
//!     payload length (u32)
//!     payload
//! DATA_RECEIVED (6):
//!     last received packet id (u32) - cumulative acknowledgement
//! DATA_REQUEST (7), DATA_REQUEST_ON_RECONNECT (8):
//!     first missing packet id (u32)
//! ```
//!
//! ## Handshakes
//!
//! Establishing a connection and re-joining it after a transport failure both use a
//!  three-message exchange:
//!
//! ```ascii
//! initiator                                    acceptor
//!    NEW_CONNECTION / JOIN_CONNECTION  ------>
//!                                      <------  ACKNOWLEDGE(kind, 1)
//!    ACKNOWLEDGE(kind, 2)              ------>
//! ```
//!
//! After a re-join, the acceptor asks for everything it has not received yet
//!  (`DATA_REQUEST_ON_RECONNECT`), the initiator re-sends that and answers with
//!  `ACKNOWLEDGE(DATA_REQUEST_ON_RECONNECT, first id it is missing)`, causing the acceptor to
//!  re-send in turn. Duplicates are discarded by packet id.
//!
//! Closing is a separate handshake: `CLOSE_CONNECTION` is re-sent until it is acknowledged with
//!  `ACKNOWLEDGE(CLOSE_CONNECTION, 0)`.

pub mod config;
pub mod packet_id;
pub mod connection_id;
pub mod command;
pub mod frame_reader;
pub mod transport;
pub mod bound_transport;
pub mod connection_record;
pub mod supervisor;
mod retry_sender;
mod recovery;
pub mod socket;
mod util;

pub use config::ResilientConfig;
pub use connection_id::ConnectionId;
pub use connection_record::ConnectionState;
pub use socket::{ResilientListener, ResilientSocket, SocketReader, SocketWriter};
pub use supervisor::Supervisor;

#[cfg(test)]
mod test_util;
