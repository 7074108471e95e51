//! Hexdump command implementation.
//!
//! Displays raw target memory in traditional hexdump format, useful for
//! verifying offsets against a live process.
//!
//! # Output Format
//!
//! ```text
//! 0x000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|
//! ```

use anyhow::{bail, Context, Result};
use burrow_core::{ProcessLink, ReadMemory};

/// Run the hexdump command
pub fn run(pid: u32, address: &str, size: usize) -> Result<()> {
    let address = parse_address(address)?;

    let mut link = ProcessLink::for_pid(pid);
    link.attach().context("attaching")?;

    let mut bytes = vec![0u8; size];
    link.read_raw(address, &mut bytes).context("reading")?;
    link.detach()?;

    println!("Hexdump at 0x{address:X} ({size} bytes):");
    println!();

    for (i, chunk) in bytes.chunks(16).enumerate() {
        let offset = i * 16;
        print!("0x{offset:03X}: ");

        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                print!(" ");
            }
            print!("{byte:02X} ");
        }
        if chunk.len() < 16 {
            for j in chunk.len()..16 {
                if j == 8 {
                    print!(" ");
                }
                print!("   ");
            }
        }

        print!(" |");
        for byte in chunk {
            if *byte >= 0x20 && *byte < 0x7F {
                print!("{}", *byte as char);
            } else {
                print!(".");
            }
        }
        println!("|");
    }
    Ok(())
}

fn parse_address(text: &str) -> Result<u32> {
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    match u32::from_str_radix(trimmed, 16) {
        Ok(addr) => Ok(addr),
        Err(_) => bail!("bad address {text:?}, expected hex like 0x8a1000"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_accepts_prefixes() {
        assert_eq!(parse_address("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_address("1000").unwrap(), 0x1000);
        assert!(parse_address("zz").is_err());
    }
}
