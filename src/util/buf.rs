use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let bytes = try_get_bytes(buf)?;
    let s = String::from_utf8(bytes.to_vec())?;
    Ok(s)
}

pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        other => bail!("invalid presence marker {}", other),
    }
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("buffer underflow: {} bytes required, {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("$cbs")]
    #[case::multi_byte("gerät-ä")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::none(None)]
    #[case::some(Some("abc123"))]
    fn test_opt_string(#[case] s: Option<&str>) {
        let mut buf = BytesMut::new();
        put_opt_string(&mut buf, s);
        let mut b: &[u8] = &buf;
        assert_eq!(try_get_opt_string(&mut b).unwrap().as_deref(), s);
    }

    #[test]
    fn test_truncated_bytes() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"payload");
        let mut b: &[u8] = &buf[..4];
        assert!(try_get_bytes(&mut b).is_err());
    }

    #[test]
    fn test_missing_presence_marker() {
        let mut b: &[u8] = &[];
        assert!(try_get_opt_string(&mut b).is_err());
    }

    #[test]
    fn test_invalid_presence_marker() {
        let mut b: &[u8] = &[7];
        assert!(try_get_opt_string(&mut b).is_err());
    }
}
