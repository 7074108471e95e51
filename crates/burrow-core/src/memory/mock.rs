//! Sparse in-memory stand-in for a target process image.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

#[derive(Default)]
pub struct MockMemory {
    bytes: HashMap<u32, u8>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, addr: u32, value: u8) {
        self.bytes.insert(addr, value);
    }

    pub fn put_u16(&mut self, addr: u32, value: u16) {
        self.put_bytes(addr, &value.to_le_bytes());
    }

    pub fn put_u32(&mut self, addr: u32, value: u32) {
        self.put_bytes(addr, &value.to_le_bytes());
    }

    pub fn put_cstring(&mut self, addr: u32, s: &str) {
        self.put_bytes(addr, s.as_bytes());
        self.put_u8(addr + s.len() as u32, 0);
    }

    pub fn put_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u32, *b);
        }
    }

    fn byte(&self, addr: u32) -> Result<u8> {
        self.bytes.get(&addr).copied().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("mock memory: unmapped address {addr:#x}"),
            ))
        })
    }
}

impl ReadMemory for MockMemory {
    fn read_u8(&mut self, addr: u32) -> Result<u8> {
        self.byte(addr)
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_raw(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_raw(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f32(&mut self, addr: u32) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32(addr)?))
    }

    fn read_raw(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.byte(addr + i as u32)?;
        }
        Ok(())
    }
}
