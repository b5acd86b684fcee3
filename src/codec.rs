// src/codec.rs
//! Fixed-width `paymasterAndData` layouts:
//!
//! - `[paymaster 20][token 20]`
//! - `[paymaster 20][token 20][validAfter 32][validUntil 32]`
//!
//! Times are ABI words holding a uint48.

use ethers::types::{Address, Bytes};

use crate::error::{PaymasterError, PaymasterResult};
use crate::types::{SponsorData, ValidityWindow};

const ADDRESS_LEN: usize = 20;
const WORD_LEN: usize = 32;
const UINT48_LEN: usize = 6;
const MAX_UINT48: u64 = (1 << 48) - 1;

pub const SHORT_LEN: usize = 2 * ADDRESS_LEN;
pub const WINDOWED_LEN: usize = SHORT_LEN + 2 * WORD_LEN;

pub fn encode(data: &SponsorData) -> Bytes {
    let mut out = Vec::with_capacity(WINDOWED_LEN);
    out.extend_from_slice(data.paymaster.as_bytes());
    out.extend_from_slice(data.token.as_bytes());

    if let Some(window) = data.window {
        out.extend_from_slice(&time_word(window.valid_after));
        out.extend_from_slice(&time_word(window.valid_until));
    }

    Bytes::from(out)
}

pub fn decode(data: &[u8]) -> PaymasterResult<SponsorData> {
    let window = match data.len() {
        SHORT_LEN => None,
        WINDOWED_LEN => {
            let times = &data[SHORT_LEN..];
            Some(ValidityWindow::new(
                read_time_word(&times[..WORD_LEN])?,
                read_time_word(&times[WORD_LEN..])?,
            ))
        }
        len => {
            return Err(PaymasterError::MalformedSponsorData(format!(
                "length {len}, expected {SHORT_LEN} or {WINDOWED_LEN}"
            )))
        }
    };

    Ok(SponsorData {
        paymaster: Address::from_slice(&data[..ADDRESS_LEN]),
        token: Address::from_slice(&data[ADDRESS_LEN..SHORT_LEN]),
        window,
    })
}

fn time_word(time: u64) -> [u8; WORD_LEN] {
    let time = time.min(MAX_UINT48);
    let mut word = [0u8; WORD_LEN];
    word[WORD_LEN - 8..].copy_from_slice(&time.to_be_bytes());
    word
}

fn read_time_word(word: &[u8]) -> PaymasterResult<u64> {
    let (high, low) = word.split_at(WORD_LEN - UINT48_LEN);
    if high.iter().any(|b| *b != 0) {
        return Err(PaymasterError::MalformedSponsorData(
            "validity time exceeds uint48".to_string(),
        ));
    }
    let mut buf = [0u8; 8];
    buf[8 - UINT48_LEN..].copy_from_slice(low);
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sponsor(window: Option<ValidityWindow>) -> SponsorData {
        SponsorData {
            paymaster: Address::repeat_byte(0xaa),
            token: Address::repeat_byte(0xbb),
            window,
        }
    }

    #[test]
    fn short_layout_is_plain_concatenation() {
        let encoded = encode(&sponsor(None));
        assert_eq!(encoded.len(), SHORT_LEN);
        assert_eq!(&encoded[..20], &[0xaa; 20]);
        assert_eq!(&encoded[20..], &[0xbb; 20]);
        assert_eq!(decode(&encoded).unwrap(), sponsor(None));
    }

    #[test]
    fn windowed_layout() {
        let data = sponsor(Some(ValidityWindow::new(1_700_000_000, 1_700_003_600)));
        let encoded = encode(&data);
        assert_eq!(encoded.len(), WINDOWED_LEN);
        assert_eq!(encoded[SHORT_LEN + WORD_LEN - 1], (1_700_000_000u64 & 0xff) as u8);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn matches_hex_concat_of_addresses() {
        let paymaster: Address = "0x21dF544947ba3E8b3c32561399E88B52Dc8b2823".parse().unwrap();
        let token: Address = "0xf93b0549cD50c849D792f0eAE94A598fA77C7718".parse().unwrap();
        let encoded = encode(&SponsorData {
            paymaster,
            token,
            window: None,
        });
        assert_eq!(
            hex::encode(&encoded),
            "21df544947ba3e8b3c32561399e88b52dc8b2823f93b0549cd50c849d792f0eae94a598fa77c7718"
        );
    }

    #[test]
    fn rejects_unknown_lengths() {
        for len in [0, 20, 39, 41, 72, 103, 105] {
            let err = decode(&vec![1u8; len]).unwrap_err();
            assert!(matches!(err, PaymasterError::MalformedSponsorData(_)), "{len}");
        }
    }

    #[test]
    fn rejects_oversized_time_word() {
        let mut encoded = encode(&sponsor(Some(ValidityWindow::new(1, 2)))).to_vec();
        encoded[SHORT_LEN] = 1;
        assert!(matches!(
            decode(&encoded),
            Err(PaymasterError::MalformedSponsorData(_))
        ));
    }
}
