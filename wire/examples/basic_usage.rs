//! Basic usage example for the serial wire framing.

use bm_wire::{crc32c, decode, encode, max_stuffed_len, MAX_L2_FRAME, MAX_WIRE_FRAME};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== bm-wire Framing Example ===\n");

    // 1. Encode an L2 frame for the serial link
    println!("1. Encoding an L2 frame...");
    let l2: Vec<u8> = b"\x02\x00\x00\x00\x00\x02\x01\x00\x00\x00\x00\x01\xb1\x01hello".to_vec();
    let mut wire = vec![0u8; MAX_WIRE_FRAME];
    let wire_len = encode(&mut wire, &l2)?;
    println!("   {} L2 bytes -> {} wire bytes", l2.len(), wire_len);
    println!(
        "   zero bytes in the body: {}",
        wire[..wire_len - 1].iter().filter(|&&b| b == 0).count()
    );
    println!("   terminator: {:#04x}", wire[wire_len - 1]);

    // 2. Decode it back (terminator stripped by the receive loop)
    println!("\n2. Decoding the wire frame...");
    let mut decoded = vec![0u8; MAX_L2_FRAME];
    let decoded_len = decode(&mut decoded, &wire[..wire_len - 1])?;
    println!("   decoded {} bytes, match: {}", decoded_len, decoded[..decoded_len] == l2[..]);

    // 3. Corruption is caught by the checksum
    println!("\n3. Flipping one bit...");
    let mut corrupt = wire[..wire_len - 1].to_vec();
    corrupt[3] ^= 0x01;
    match decode(&mut decoded, &corrupt) {
        Ok(_) => println!("   unexpectedly decoded"),
        Err(err) => println!("   rejected: {err}"),
    }

    // 4. Checksum and overhead helpers
    println!("\n4. Helpers...");
    println!("   crc32c(\"123456789\") = {:#010X}", crc32c(b"123456789"));
    println!(
        "   worst-case stuffed length for {} bytes: {}",
        MAX_L2_FRAME,
        max_stuffed_len(MAX_L2_FRAME + 6)
    );

    Ok(())
}
