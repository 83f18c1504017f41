use std::fmt::{Display, Formatter};

/// Sequence number of a DATA packet in one direction of a logical connection. Packet ids start
///  at 0 and are never reset, not even when the connection is re-joined over a new transport
///  connection.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// NB: The sender never hands out `u32::MAX` (see [PacketId::checked_next]), so this can not
    ///      overflow for ids received from a well-behaved peer
    pub fn next(&self) -> PacketId {
        PacketId(self.0.saturating_add(1))
    }

    /// Returns `None` if the following id is the last one representable on the wire - that id
    ///  is reserved so that receive-side arithmetic can not overflow
    pub fn checked_next(&self) -> Option<PacketId> {
        match self.0.checked_add(1) {
            Some(u32::MAX) | None => None,
            Some(n) => Some(PacketId(n)),
        }
    }

    pub fn prev(&self) -> Option<PacketId> {
        self.0.checked_sub(1).map(PacketId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, Some(1))]
    #[case::regular(17, Some(18))]
    #[case::last_regular(u32::MAX - 2, Some(u32::MAX - 1))]
    #[case::exhausted(u32::MAX - 1, None)]
    #[case::max(u32::MAX, None)]
    fn test_checked_next(#[case] raw: u32, #[case] expected: Option<u32>) {
        assert_eq!(PacketId::from_raw(raw).checked_next(), expected.map(PacketId::from_raw));
    }

    #[rstest]
    #[case::zero(0, None)]
    #[case::one(1, Some(0))]
    #[case::max(u32::MAX, Some(u32::MAX - 1))]
    fn test_prev(#[case] raw: u32, #[case] expected: Option<u32>) {
        assert_eq!(PacketId::from_raw(raw).prev(), expected.map(PacketId::from_raw));
    }
}
