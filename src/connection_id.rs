use std::fmt::{Debug, Display, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::util::buf::{put_string, BufExt};

/// The identity of a logical connection. It is assigned once by the side initiating the
///  connection and stays the same for the connection's lifetime, no matter how many transport
///  connections carry it.
///
/// NB: The initiator id is generated per [crate::Supervisor], so connection ids from different
///      supervisors can not collide even if they talk to the same acceptor
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    pub initiator: Uuid,
    pub connection: u32,
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}#{}]", self.initiator, self.connection)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl ConnectionId {
    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        put_string(buf, &self.initiator.hyphenated().to_string())?;
        buf.put_u32(self.connection);
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionId> {
        let raw_initiator = buf.get_string_checked()?;
        let initiator = Uuid::parse_str(&raw_initiator)
            .map_err(|e| anyhow!("invalid initiator id {:?}: {}", raw_initiator, e))?;
        let connection = buf.get_u32_checked()?;

        Ok(ConnectionId {
            initiator,
            connection,
        })
    }
}
