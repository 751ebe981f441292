//! Property-based round-trip checks for the bit-level transforms

use proptest::prelude::*;
use sonde_core::assembler::{pack_bits, rs41_descramble, unpack_bytes};
use sonde_core::bits::{biphase_decode, biphase_encode, pn9_apply, BiphaseVariant};
use sonde_core::catalog::BitOrder;
use sonde_core::checksum::{crc16_ccitt, crc16_reflected};

proptest! {
    #[test]
    fn ccitt_crc_of_message_plus_crc_is_zero(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let crc = crc16_ccitt(&data, 0xFFFF);
        let mut framed = data.clone();
        framed.push((crc >> 8) as u8);
        framed.push((crc & 0xFF) as u8);
        prop_assert_eq!(crc16_ccitt(&framed, 0xFFFF), 0);
    }

    #[test]
    fn reflected_crc_of_message_plus_crc_is_zero(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let crc = crc16_reflected(&data);
        let mut framed = data.clone();
        framed.push((crc & 0xFF) as u8);
        framed.push((crc >> 8) as u8);
        prop_assert_eq!(crc16_reflected(&framed), 0);
    }

    #[test]
    fn pn9_whitening_is_an_involution(
        data in proptest::collection::vec(any::<u8>(), 0..300),
        skip in 0usize..16,
    ) {
        let mut buf = data.clone();
        pn9_apply(&mut buf, skip);
        pn9_apply(&mut buf, skip);
        prop_assert_eq!(buf, data);
    }

    #[test]
    fn rs41_mask_is_an_involution(data in proptest::collection::vec(any::<u8>(), 0..520)) {
        let mut buf = data.clone();
        rs41_descramble(&mut buf);
        rs41_descramble(&mut buf);
        prop_assert_eq!(buf, data);
    }

    #[test]
    fn manchester_roundtrip(bits in proptest::collection::vec(0u8..2, 0..512)) {
        for variant in [BiphaseVariant::Manchester1, BiphaseVariant::Manchester2] {
            let encoded = biphase_encode(&bits, variant);
            prop_assert_eq!(biphase_decode(&encoded, variant), bits.clone());
        }
    }

    #[test]
    fn byte_packing_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        for order in [BitOrder::LsbFirst, BitOrder::MsbFirst] {
            let bits = unpack_bytes(&bytes, order);
            prop_assert_eq!(pack_bits(&bits, order), bytes.clone());
        }
    }
}
