//! Cryptographic primitives for the BLE broadcast path.
//!
//! Implements the Bluetooth Core Specification `e` and `ah` functions used
//! to verify resolvable private addresses against an identity resolving
//! key, and the AES decryption of the broadcast payload. All functions are
//! pure and reject wrong-sized input instead of panicking.

use aes::{
   Aes128,
   cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};

/// AES-128 single-block encryption with the byte-ordering convention of the
/// Bluetooth security functions: key and data are reversed before
/// encryption and the output is reversed again.
pub fn block_encrypt(key: &[u8], data: &[u8]) -> Option<[u8; 16]> {
   if key.len() != 16 || data.len() != 16 {
      return None;
   }

   let mut reversed_key = [0u8; 16];
   reversed_key.copy_from_slice(key);
   reversed_key.reverse();

   let mut block = [0u8; 16];
   block.copy_from_slice(data);
   block.reverse();

   let cipher = Aes128::new(GenericArray::from_slice(&reversed_key));
   let mut block = GenericArray::from(block);
   cipher.encrypt_block(&mut block);

   let mut out: [u8; 16] = block.into();
   out.reverse();
   Some(out)
}

/// The `ah` random-address hash function: the 3-byte random part is
/// zero-padded to a block, encrypted under the IRK, and truncated to
/// 3 bytes.
pub fn resolvable_address_hash(irk: &[u8], random_part: &[u8]) -> Option<[u8; 3]> {
   if random_part.len() < 3 {
      return None;
   }

   let mut padded = [0u8; 16];
   padded[..3].copy_from_slice(&random_part[..3]);

   let encrypted = block_encrypt(irk, &padded)?;
   Some([encrypted[0], encrypted[1], encrypted[2]])
}

/// Verifies a colon-hex Bluetooth address as a resolvable private address
/// under the given IRK. Malformed input returns false.
pub fn verify_resolvable_address(address: &str, irk: &[u8]) -> bool {
   if irk.len() != 16 {
      return false;
   }

   let mut rpa = [0u8; 6];
   let mut count = 0;
   for part in address.split(':') {
      if count == 6 {
         return false;
      }
      let Ok(byte) = u8::from_str_radix(part, 16) else {
         return false;
      };
      rpa[count] = byte;
      count += 1;
   }
   if count != 6 {
      return false;
   }
   // The printed form is most-significant byte first
   rpa.reverse();

   let random_part = &rpa[3..6];
   let claimed_hash = &rpa[..3];
   match resolvable_address_hash(irk, random_part) {
      Some(hash) => hash == claimed_hash,
      None => false,
   }
}

/// Decrypts the trailing 16 bytes of `data` with AES-128-CBC under a zero
/// IV, key used as-is. A single block with a zero IV reduces to one raw
/// block decryption.
pub fn decrypt_payload(data: &[u8], key: &[u8]) -> Option<[u8; 16]> {
   if data.len() < 16 || key.len() != 16 {
      return None;
   }

   let mut block = [0u8; 16];
   block.copy_from_slice(&data[data.len() - 16..]);

   let cipher = Aes128::new(GenericArray::from_slice(key));
   let mut block = GenericArray::from(block);
   cipher.decrypt_block(&mut block);
   Some(block.into())
}

#[cfg(test)]
mod tests {
   use super::*;

   // Sample data from the Bluetooth Core Specification for the ah function,
   // converted to the least-significant-byte-first convention used here.
   // IRK 0xec0234a357c8ad05341010a60a397d9b, prand 0x708194, hash 0x0dfbaa.
   const IRK: [u8; 16] = [
      0x9b, 0x7d, 0x39, 0x0a, 0xa6, 0x10, 0x10, 0x34, 0x05, 0xad, 0xc8, 0x57, 0xa3, 0x34, 0x02,
      0xec,
   ];
   const PRAND: [u8; 3] = [0x94, 0x81, 0x70];
   const HASH: [u8; 3] = [0xaa, 0xfb, 0x0d];
   const RPA: &str = "70:81:94:0D:FB:AA";

   #[test]
   fn ah_spec_sample() {
      assert_eq!(resolvable_address_hash(&IRK, &PRAND), Some(HASH));
   }

   #[test]
   fn verify_matching_address() {
      assert!(verify_resolvable_address(RPA, &IRK));
      // Lowercase form resolves too
      assert!(verify_resolvable_address(&RPA.to_ascii_lowercase(), &IRK));
   }

   #[test]
   fn verify_rejects_single_bit_flips() {
      let mut bytes = [0x70u8, 0x81, 0x94, 0x0D, 0xFB, 0xAA];
      for byte in 0..6 {
         for bit in 0..8 {
            bytes[byte] ^= 1 << bit;
            let address = bytes
               .iter()
               .map(|b| format!("{b:02X}"))
               .collect::<Vec<_>>()
               .join(":");
            assert!(
               !verify_resolvable_address(&address, &IRK),
               "bit {bit} of byte {byte} still resolved"
            );
            bytes[byte] ^= 1 << bit;
         }
      }
   }

   #[test]
   fn verify_rejects_malformed_input() {
      assert!(!verify_resolvable_address("", &IRK));
      assert!(!verify_resolvable_address("70:81:94:0D:FB", &IRK));
      assert!(!verify_resolvable_address("70:81:94:0D:FB:AA:00", &IRK));
      assert!(!verify_resolvable_address("70:81:94:0D:FB:ZZ", &IRK));
      assert!(!verify_resolvable_address(RPA, &IRK[..15]));
   }

   #[test]
   fn block_encrypt_requires_full_blocks() {
      assert!(block_encrypt(&IRK, &[0u8; 15]).is_none());
      assert!(block_encrypt(&IRK[..8], &[0u8; 16]).is_none());
      assert!(block_encrypt(&IRK, &[0u8; 16]).is_some());
   }

   #[test]
   fn payload_decryption_round_trip() {
      let key = [0x42u8; 16];
      let plain = *b"0123456789abcdef";

      let cipher = Aes128::new(GenericArray::from_slice(&key));
      let mut block = GenericArray::from(plain);
      cipher.encrypt_block(&mut block);
      let encrypted: [u8; 16] = block.into();

      assert_eq!(decrypt_payload(&encrypted, &key), Some(plain));

      // Only the trailing block is decrypted
      let mut prefixed = vec![0xAA; 11];
      prefixed.extend_from_slice(&encrypted);
      assert_eq!(decrypt_payload(&prefixed, &key), Some(plain));
   }

   #[test]
   fn payload_decryption_rejects_short_input() {
      assert!(decrypt_payload(&[0u8; 15], &[0u8; 16]).is_none());
      assert!(decrypt_payload(&[0u8; 16], &[0u8; 8]).is_none());
   }
}
