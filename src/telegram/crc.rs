use crc16::{State, EN_13757};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CrcError {
    #[error("link layer crc mismatch in block starting at {0}")]
    Mismatch(usize),
    #[error("frame too short for link layer crc check")]
    TooShort,
}

fn crc_of(bytes: &[u8]) -> [u8; 2] {
    let mut state = State::<EN_13757>::new();
    state.update(bytes);
    state.get().to_be_bytes()
}

/// Frame format A: a 10 byte first block followed by 16 byte blocks, each
/// block carries its own two crc bytes. The last block may be shorter.
/// Returns the payload with all crc bytes removed.
pub fn strip_frame_format_a(telegram: &[u8]) -> Result<Vec<u8>, CrcError> {
    let mut result = Vec::with_capacity(telegram.len());
    let mut start = 0;
    let mut first_block = true;

    loop {
        let mut len = if first_block { 10 } else { 16 };
        first_block = false;

        /* Short trailing block, whatever remains minus its crc. */
        if telegram.len() < start + len + 2 {
            if telegram.len() < start + 3 {
                return Err(CrcError::TooShort);
            }
            len = telegram.len() - start - 2;
        }

        let end = start + len;
        let crc = crc_of(&telegram[start..end]);
        if crc[0] != telegram[end] || crc[1] != telegram[end + 1] {
            return Err(CrcError::Mismatch(start));
        }
        result.extend_from_slice(&telegram[start..end]);

        start = end + 2;
        if telegram.len() == start {
            break;
        }
    }

    Ok(result)
}

/// Frame format B: one crc over everything, placed in the last two bytes.
pub fn strip_frame_format_b(telegram: &[u8]) -> Result<Vec<u8>, CrcError> {
    if telegram.len() < 3 {
        return Err(CrcError::TooShort);
    }
    let end = telegram.len() - 2;
    let crc = crc_of(&telegram[..end]);
    if crc[0] != telegram[end] || crc[1] != telegram[end + 1] {
        return Err(CrcError::Mismatch(0));
    }
    Ok(telegram[..end].to_vec())
}

/// Insert block crcs, format A. Used when writing simulation files and to
/// test that stripping is the left inverse of insertion.
pub fn insert_frame_format_a(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + 4);
    let mut start = 0;
    let mut first_block = true;
    while start < payload.len() {
        let len = if first_block { 10 } else { 16 };
        first_block = false;
        let end = (start + len).min(payload.len());
        out.extend_from_slice(&payload[start..end]);
        out.extend_from_slice(&crc_of(&payload[start..end]));
        start = end;
    }
    out
}

pub fn insert_frame_format_b(payload: &[u8]) -> Vec<u8> {
    let mut out = payload.to_vec();
    out.extend_from_slice(&crc_of(payload));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /* Open Metering System Specification Vol. 2 Annex N, N.2.1, a frame
       with crc blocks as transported on the radio. */
    const ANNEX_N_FRAME: &str = "2E44931578563412330333637A2A0020255923C95AAA26D1B2E7493BC2AD013EC4A6F6D3529B520EDFF0EA6DEFC955B29D6D69EBF3EC8A";

    #[test]
    fn strips_format_a_blocks() {
        let data = hex::decode(ANNEX_N_FRAME).unwrap();
        let stripped = strip_frame_format_a(&data).unwrap();
        assert_eq!(stripped.len(), data.len() - 8);
        assert_eq!(stripped[0], 0x2e);
        assert_eq!(stripped[10], 0x7a);
    }

    #[test]
    fn corrupt_crc_is_rejected_not_panicking() {
        let mut data = hex::decode(ANNEX_N_FRAME).unwrap();
        data[11] ^= 0xff; // First block crc byte.
        assert_eq!(strip_frame_format_a(&data), Err(CrcError::Mismatch(0)));
    }

    #[test]
    fn strip_is_left_inverse_of_insert() {
        let payload: Vec<u8> = (0u8..47).collect();
        let framed = insert_frame_format_a(&payload);
        assert_eq!(strip_frame_format_a(&framed).unwrap(), payload);

        let framed = insert_frame_format_b(&payload);
        assert_eq!(strip_frame_format_b(&framed).unwrap(), payload);
    }

    #[test]
    fn short_frames_error_out() {
        assert_eq!(strip_frame_format_a(&[0x01]), Err(CrcError::TooShort));
        assert_eq!(strip_frame_format_b(&[0x01, 0x02]), Err(CrcError::TooShort));
    }
}
