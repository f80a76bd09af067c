use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit, StreamCipher};
use log::debug;
use thiserror::Error;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

#[derive(Error, Debug, PartialEq)]
pub enum CryptoError {
    #[error("aes key must be 16 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("encrypted content is not a whole number of aes blocks")]
    BadBlockLength,
    #[error("decrypted content does not start with 2F2F, wrong key?")]
    DecryptCheckFailed,
}

/// Security mode 5, AES-CBC with IV. The iv is the eight dll address bytes
/// (m-field, a-field) followed by the access number repeated eight times.
pub fn cbc_iv(dll_address: &[u8; 8], access_no: u8) -> [u8; 16] {
    let mut iv = [access_no; 16];
    iv[..8].copy_from_slice(dll_address);
    iv
}

/// Decrypt the given number of 16 byte blocks in place at the start of
/// `content`. After a correct decrypt the first two bytes are 0x2F 0x2F.
pub fn decrypt_aes_cbc_iv(
    content: &mut [u8],
    key: &[u8],
    dll_address: &[u8; 8],
    access_no: u8,
    encrypted_blocks: usize,
) -> Result<(), CryptoError> {
    if key.len() != 16 {
        return Err(CryptoError::BadKeyLength(key.len()));
    }
    let len = (encrypted_blocks * 16).min(content.len() & !0xf);
    if len == 0 {
        return Err(CryptoError::BadBlockLength);
    }

    let iv = cbc_iv(dll_address, access_no);
    let dec = Aes128CbcDec::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::BadKeyLength(key.len()))?;
    dec.decrypt_padded_mut::<NoPadding>(&mut content[..len])
        .map_err(|_| CryptoError::BadBlockLength)?;

    if content[0] != 0x2f || content[1] != 0x2f {
        debug!("decrypt check failed, first bytes {:02x}{:02x}", content[0], content[1]);
        return Err(CryptoError::DecryptCheckFailed);
    }
    Ok(())
}

/// ELL security, AES-CTR. The initial counter block is built from the dll
/// address, the ell communication control byte and the session number.
/// There is no 2F2F check for this mode.
pub fn decrypt_aes_ctr(
    content: &mut [u8],
    key: &[u8],
    dll_address: &[u8; 8],
    cc: u8,
    sn: u32,
) -> Result<(), CryptoError> {
    if key.len() != 16 {
        return Err(CryptoError::BadKeyLength(key.len()));
    }

    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(dll_address);
    iv[8] = cc;
    iv[9..13].copy_from_slice(&sn.to_le_bytes());
    /* Frame number and block counter start at zero. */

    let mut cipher = Aes128Ctr::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::BadKeyLength(key.len()))?;
    cipher.apply_keystream(content);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /* OMS Vol. 2 Annex N, N.2.1: security profile A telegram and its key. */
    const STRIPPED: &str =
        "2E4493157856341233037A2A0020255923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3";
    const KEY: &str = "0102030405060708090A0B0C0D0E0F11";

    #[test]
    fn mode5_decrypt_starts_with_2f2f() {
        let telegram = hex::decode(STRIPPED).unwrap();
        let key = hex::decode(KEY).unwrap();
        let mut dll = [0u8; 8];
        dll.copy_from_slice(&telegram[2..10]);
        let access_no = telegram[11];
        let blocks = ((telegram[13] >> 4) & 0x0f) as usize;

        let mut content = telegram[15..].to_vec();
        decrypt_aes_cbc_iv(&mut content, &key, &dll, access_no, blocks).unwrap();
        assert_eq!(&content[..2], &[0x2f, 0x2f]);
    }

    #[test]
    fn wrong_key_reports_bad_key_without_panicking() {
        let telegram = hex::decode(STRIPPED).unwrap();
        let key = [0u8; 16];
        let mut dll = [0u8; 8];
        dll.copy_from_slice(&telegram[2..10]);

        let mut content = telegram[15..].to_vec();
        let r = decrypt_aes_cbc_iv(&mut content, &key, &dll, telegram[11], 2);
        assert_eq!(r, Err(CryptoError::DecryptCheckFailed));
    }

    #[test]
    fn short_key_is_rejected() {
        let mut content = [0u8; 16];
        let r = decrypt_aes_cbc_iv(&mut content, &[1, 2, 3], &[0; 8], 0, 1);
        assert_eq!(r, Err(CryptoError::BadKeyLength(3)));
    }

    #[test]
    fn ctr_is_its_own_inverse() {
        let key = hex::decode(KEY).unwrap();
        let dll = [0x93, 0x15, 0x78, 0x56, 0x34, 0x12, 0x33, 0x03];
        let mut content = b"some metering records".to_vec();
        let original = content.clone();

        decrypt_aes_ctr(&mut content, &key, &dll, 0x20, 0x12345678).unwrap();
        assert_ne!(content, original);
        decrypt_aes_ctr(&mut content, &key, &dll, 0x20, 0x12345678).unwrap();
        assert_eq!(content, original);
    }
}
