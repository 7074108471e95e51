//! Read access to a foreign process image.
//!
//! `ReadMemory` is the seam between the layout engine and whatever is
//! actually supplying bytes: the live shared-memory link in production,
//! an in-memory mock in tests.

#[cfg(test)]
pub mod mock;

#[cfg(test)]
pub use mock::MockMemory;

use crate::error::{Error, Result};

/// Longest C string we will assemble byte-by-byte before giving up.
pub const CSTRING_CAP: usize = 255;

/// The Itanium-style ABI facts behind dynamic type resolution, in one
/// place. The typeinfo pointer sits one pointer-width before the vtable,
/// and the mangled-name pointer one pointer-width into the typeinfo
/// object. Legacy 32-bit target: a pointer is 4 bytes.
pub const TYPEINFO_BEFORE_VTABLE: u32 = 4;
pub const TYPEINFO_NAME_OFFSET: u32 = 4;

pub trait ReadMemory {
    fn read_u8(&mut self, addr: u32) -> Result<u8>;
    fn read_u16(&mut self, addr: u32) -> Result<u16>;
    fn read_u32(&mut self, addr: u32) -> Result<u32>;
    fn read_u64(&mut self, addr: u32) -> Result<u64>;
    fn read_f32(&mut self, addr: u32) -> Result<f32>;
    fn read_raw(&mut self, addr: u32, out: &mut [u8]) -> Result<()>;

    /// Assemble a NUL-terminated string one byte at a time, capped at
    /// [`CSTRING_CAP`] bytes. Slow; used where no richer string command
    /// exists.
    fn read_cstring(&mut self, addr: u32) -> Result<String> {
        let mut bytes = Vec::new();
        for i in 0..CSTRING_CAP as u32 {
            let b = self.read_u8(addr + i)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Read the dynamic type name of an object whose vtable pointer is `vptr`.
///
/// Chases the typeinfo structure in the target's memory and strips the
/// leading run of non-letter characters from the mangled name (the encoded
/// length/namespace digits), leaving the plain class name.
pub fn read_class_name<R: ReadMemory>(reader: &mut R, vptr: u32) -> Result<String> {
    // Foreign memory is untrusted; a garbage word read as a vtable
    // pointer must not wrap below the typeinfo slot.
    let typeinfo_ptr = vptr
        .checked_sub(TYPEINFO_BEFORE_VTABLE)
        .ok_or(Error::BadVtablePointer(vptr))?;
    let typeinfo = reader.read_u32(typeinfo_ptr)?;
    let name_ptr = reader.read_u32(typeinfo + TYPEINFO_NAME_OFFSET)?;
    let raw = reader.read_cstring(name_ptr)?;
    Ok(strip_mangling(&raw).to_owned())
}

/// Drop the leading run of anything that is not an ASCII letter.
fn strip_mangling(raw: &str) -> &str {
    let start = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    &raw[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_mangling() {
        assert_eq!(strip_mangling("8building"), "building");
        assert_eq!(strip_mangling("13siege_engine"), "siege_engine");
        assert_eq!(strip_mangling("plain"), "plain");
        assert_eq!(strip_mangling("123"), "");
    }

    #[test]
    fn test_read_class_name_walks_typeinfo() {
        let mut mem = MockMemory::new();
        // vtable at 0x1000, typeinfo pointer stored just before it
        mem.put_u32(0x1000 - TYPEINFO_BEFORE_VTABLE, 0x2000);
        // typeinfo's name pointer
        mem.put_u32(0x2000 + TYPEINFO_NAME_OFFSET, 0x3000);
        mem.put_cstring(0x3000, "12workshop_dyer");
        let name = read_class_name(&mut mem, 0x1000).unwrap();
        assert_eq!(name, "workshop_dyer");
    }

    #[test]
    fn test_read_class_name_rejects_low_vptr() {
        let mut mem = MockMemory::new();
        let err = read_class_name(&mut mem, 2).unwrap_err();
        assert!(matches!(err, crate::error::Error::BadVtablePointer(2)));
    }

    #[test]
    fn test_read_cstring_caps_at_limit() {
        let mut mem = MockMemory::new();
        // 300 non-zero bytes, no terminator in range
        for i in 0..300u32 {
            mem.put_u8(0x100 + i, b'a');
        }
        let s = mem.read_cstring(0x100).unwrap();
        assert_eq!(s.len(), CSTRING_CAP);
    }
}
