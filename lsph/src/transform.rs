use std::borrow::{Borrow, Cow};

/// Strategy turning keys into the byte sequences that get hashed.
///
/// Two keys are considered equal exactly when their byte images are equal.
pub trait Transform<K: ?Sized> {
    fn to_bytes<'k>(&self, key: &'k K) -> Cow<'k, [u8]>;
}

/// Hashes the raw bytes of the key.
#[derive(Default, Copy, Clone)]
pub struct RawBytes;

impl<K: AsRef<[u8]> + ?Sized> Transform<K> for RawBytes {
    #[inline(always)] fn to_bytes<'k>(&self, key: &'k K) -> Cow<'k, [u8]> {
        Cow::Borrowed(key.as_ref())
    }
}

/// Hashes UTF-16 code units of the key, each as two little-endian bytes.
#[derive(Default, Copy, Clone)]
pub struct Utf16;

impl<K: Borrow<str> + ?Sized> Transform<K> for Utf16 {
    fn to_bytes<'k>(&self, key: &'k K) -> Cow<'k, [u8]> {
        let key = key.borrow();
        let mut bytes = Vec::with_capacity(2 * key.len());
        for unit in key.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        Cow::Owned(bytes)
    }
}

/// Hashes UTF-32 code units (scalar values) of the key, each as four little-endian bytes.
#[derive(Default, Copy, Clone)]
pub struct Utf32;

impl<K: Borrow<str> + ?Sized> Transform<K> for Utf32 {
    fn to_bytes<'k>(&self, key: &'k K) -> Cow<'k, [u8]> {
        let key = key.borrow();
        let mut bytes = Vec::with_capacity(4 * key.chars().count());
        for c in key.chars() {
            bytes.extend_from_slice(&(c as u32).to_le_bytes());
        }
        Cow::Owned(bytes)
    }
}

/// Hashes each character as a single ISO-8859-1 byte.
/// Characters above U+00FF are truncated to their low byte.
#[derive(Default, Copy, Clone)]
pub struct Iso8859_1;

impl<K: Borrow<str> + ?Sized> Transform<K> for Iso8859_1 {
    fn to_bytes<'k>(&self, key: &'k K) -> Cow<'k, [u8]> {
        Cow::Owned(key.borrow().chars().map(|c| c as u8).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes() {
        assert_eq!(RawBytes.to_bytes("ab").as_ref(), b"ab");
        assert_eq!(RawBytes.to_bytes(&[1u8, 2][..]).as_ref(), [1, 2]);
    }

    #[test]
    fn utf16() {
        assert_eq!(Utf16.to_bytes("a\u{0142}").as_ref(), [0x61, 0x00, 0x42, 0x01]);
    }

    #[test]
    fn utf32() {
        assert_eq!(Utf32.to_bytes("a").as_ref(), [0x61, 0, 0, 0]);
    }

    #[test]
    fn iso() {
        assert_eq!(Iso8859_1.to_bytes("a\u{00e9}").as_ref(), [0x61, 0xE9]);
    }
}
