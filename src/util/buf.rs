use anyhow::bail;
use bytes::{Buf, BufMut};

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                bail!("buffer underflow: {} bytes required, {} remaining", size_of::<$ty>(), self.remaining());
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for parsing data received from a peer: running out of data is a
///  protocol error, not a panic
pub trait BufExt: Buf {
    get_checked_impl!(get_u16_checked, u16, get_u16);
    get_checked_impl!(get_u32_checked, u32, get_u32);

    /// Reads a string as written by [put_string]
    fn get_string_checked(&mut self) -> anyhow::Result<String> {
        let len = self.get_u16_checked()? as usize;
        if self.remaining() < len {
            bail!("string length {} exceeds the remaining buffer of {} bytes", len, self.remaining());
        }

        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

impl <T: Buf + ?Sized> BufExt for T {
}

/// Writes a string as a u16 length prefix followed by its UTF-8 bytes
pub fn put_string(buf: &mut impl BufMut, s: &str) -> anyhow::Result<()> {
    let len: u16 = match s.len().try_into() {
        Ok(len) => len,
        Err(_) => bail!("string of {} bytes exceeds the maximum length of {}", s.len(), u16::MAX),
    };
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("", vec![0,0])]
    #[case::a("a", vec![0,1,97])]
    #[case::abc("abc", vec![0,3,97,98,99])]
    #[case::umlaut("ä", vec![0,2,0xc3,0xa4])]
    #[case::heart("❤️", vec![0,6, 226,157,164,239,184,143])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s).unwrap();
        assert_eq!(&buf, &expected);

        let mut deser_buf = buf.as_ref();
        let deser = deser_buf.get_string_checked().unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_put_string_too_long() {
        let s = "x".repeat(u16::MAX as usize + 1);
        let mut buf = BytesMut::new();
        assert!(put_string(&mut buf, &s).is_err());
    }

    #[test]
    fn test_get_string_remaining() {
        let mut buf: &[u8] = b"\0\x01abc";
        let actual = buf.get_string_checked().unwrap();
        assert_eq!(&actual, "a");
        assert_eq!(buf.chunk(), b"bc");
    }

    #[rstest]
    #[case::no_length(b"")]
    #[case::partial_length(b"\0")]
    #[case::too_short(b"\0\x02a")]
    #[case::not_unicode(b"\0\x02\xc0\xaf")]
    fn test_get_string_invalid(#[case] mut buf: &[u8]) {
        assert!(buf.get_string_checked().is_err());
    }

    #[rstest]
    #[case::empty(b"", None)]
    #[case::short(b"\x01\x02\x03", None)]
    #[case::exact(b"\x01\x02\x03\x04", Some(0x01020304))]
    #[case::longer(b"\0\0\x01\0\x07", Some(256))]
    fn test_get_u32_checked(#[case] mut buf: &[u8], #[case] expected: Option<u32>) {
        assert_eq!(buf.get_u32_checked().ok(), expected);
    }
}
