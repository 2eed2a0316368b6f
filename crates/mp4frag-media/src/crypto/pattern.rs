use super::{check_output, Iv, StreamCipher, AES_BLOCK_SIZE};
use crate::{Error, Result};

/// Encrypts `crypt_byte_block` blocks then leaves `skip_byte_block`
/// blocks clear, repeating. A trailing partial block stays clear.
///
/// The inner cipher only sees the encrypted blocks, so its stream offset
/// counts encrypted bytes.
pub struct PatternStreamCipher<C> {
    inner: C,
    crypt_byte_block: u64,
    skip_byte_block: u64,
    offset: u64,
}

impl<C: StreamCipher> PatternStreamCipher<C> {
    pub fn new(inner: C, crypt_byte_block: u8, skip_byte_block: u8) -> Self {
        Self {
            inner,
            crypt_byte_block: crypt_byte_block as u64,
            skip_byte_block: skip_byte_block as u64,
            offset: 0,
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn is_encrypted_block(&self, block: u64) -> bool {
        let period = self.crypt_byte_block + self.skip_byte_block;
        period == 0 || self.skip_byte_block == 0 || block % period < self.crypt_byte_block
    }

    /// Encrypted bytes ahead of the block-aligned stream `offset`.
    fn encrypted_before(&self, offset: u64) -> u64 {
        let blocks = offset / AES_BLOCK_SIZE as u64;
        let period = self.crypt_byte_block + self.skip_byte_block;
        let encrypted = if period == 0 || self.skip_byte_block == 0 {
            blocks
        } else {
            (blocks / period) * self.crypt_byte_block + (blocks % period).min(self.crypt_byte_block)
        };
        encrypted * AES_BLOCK_SIZE as u64
    }
}

impl<C: StreamCipher> StreamCipher for PatternStreamCipher<C> {
    fn process_buffer(&mut self, input: &[u8], output: &mut [u8], is_last: bool) -> Result<usize> {
        if self.offset % AES_BLOCK_SIZE as u64 != 0 {
            return Err(Error::invalid_format(format!(
                "pattern cipher called at unaligned offset {}",
                self.offset
            )));
        }
        check_output(output, input.len())?;

        let mut block = self.offset / AES_BLOCK_SIZE as u64;
        let mut pos = 0;
        while pos + AES_BLOCK_SIZE <= input.len() {
            let range = pos..pos + AES_BLOCK_SIZE;
            if self.is_encrypted_block(block) {
                let written = self.inner.process_buffer(&input[range.clone()], &mut output[range], false)?;
                if written != AES_BLOCK_SIZE {
                    return Err(Error::invalid_state("pattern inner cipher buffered a whole block"));
                }
            } else {
                output[range.clone()].copy_from_slice(&input[range]);
            }
            pos += AES_BLOCK_SIZE;
            block += 1;
        }
        output[pos..input.len()].copy_from_slice(&input[pos..]);
        self.offset += input.len() as u64;
        if is_last {
            self.offset = 0;
            self.inner.set_stream_offset(0)?;
        }
        Ok(input.len())
    }

    fn output_size(&self, input_size: usize, _is_last: bool) -> usize {
        input_size
    }

    fn set_stream_offset(&mut self, offset: u64) -> Result<()> {
        if offset % AES_BLOCK_SIZE as u64 != 0 {
            return Err(Error::invalid_format(format!(
                "pattern cipher offset {offset} is not block aligned"
            )));
        }
        self.inner.set_stream_offset(self.encrypted_before(offset))?;
        self.offset = offset;
        Ok(())
    }

    fn stream_offset(&self) -> u64 {
        self.offset
    }

    fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.inner.set_iv(iv)?;
        self.offset = 0;
        Ok(())
    }

    fn iv(&self) -> &Iv {
        self.inner.iv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CbcStreamCipher, CounterSize, CtrStreamCipher, Direction, Padding};
    use crate::ErrorKind;

    const KEY: [u8; 16] = [3; 16];
    const IV: [u8; 16] = [5; 16];

    fn ctr() -> CtrStreamCipher {
        CtrStreamCipher::new(&KEY, &IV, CounterSize::Bytes8)
    }

    #[test]
    fn test_one_in_ten_blocks() {
        let plain: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let out = PatternStreamCipher::new(ctr(), 1, 9).process(&plain, true).unwrap();

        assert_eq!(out.len(), 200);
        assert_ne!(out[..16], plain[..16]);
        assert_eq!(out[16..160], plain[16..160]);
        assert_ne!(out[160..176], plain[160..176]);
        assert_eq!(out[176..], plain[176..]);

        // the keystream only advances over encrypted blocks
        let crypted = [&plain[..16], &plain[160..176]].concat();
        let expected = ctr().process(&crypted, true).unwrap();
        assert_eq!([&out[..16], &out[160..176]].concat(), expected);
    }

    #[test]
    fn test_cbc_pattern_round_trip() {
        let plain: Vec<u8> = (0..100).map(|i| (i * 7) as u8).collect();
        let cbc = |direction| CbcStreamCipher::new(&KEY, &IV, direction, Padding::None);
        let encrypted = PatternStreamCipher::new(cbc(Direction::Encrypt), 1, 9)
            .process(&plain, true)
            .unwrap();
        assert_eq!(encrypted[16..], plain[16..]);
        let decrypted = PatternStreamCipher::new(cbc(Direction::Decrypt), 1, 9)
            .process(&encrypted, true)
            .unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_unaligned_call() {
        let mut cipher = PatternStreamCipher::new(ctr(), 1, 9);
        assert_eq!(cipher.process(&[0; 10], false).unwrap(), vec![0; 10]);
        let err = cipher.process(&[0; 16], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
        assert_eq!(cipher.set_stream_offset(8).unwrap_err().kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_seek_skips_clear_blocks() {
        let plain = vec![0x42u8; 320];
        let whole = PatternStreamCipher::new(ctr(), 2, 3).process(&plain, false).unwrap();
        let mut cipher = PatternStreamCipher::new(ctr(), 2, 3);
        cipher.set_stream_offset(112).unwrap();
        assert_eq!(cipher.process(&plain[112..], false).unwrap(), whole[112..]);
    }
}
