use super::{check_output, parse_iv, Iv, Key, StreamCipher};
use crate::Result;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher as _, StreamCipherSeek};
use aes::Aes128;

/// Width of the big-endian block counter at the end of the IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterSize {
    /// The low 8 bytes count and wrap on their own.
    #[default]
    Bytes8,
    Bytes16,
}

enum Keystream {
    Ctr64(ctr::Ctr64BE<Aes128>),
    Ctr128(ctr::Ctr128BE<Aes128>),
}

impl Keystream {
    fn new(key: &Key, iv: &Iv, counter: CounterSize) -> Self {
        let (key, iv) = (GenericArray::from_slice(key), GenericArray::from_slice(iv));
        match counter {
            CounterSize::Bytes8 => Self::Ctr64(ctr::Ctr64BE::new(key, iv)),
            CounterSize::Bytes16 => Self::Ctr128(ctr::Ctr128BE::new(key, iv)),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Ctr64(c) => c.apply_keystream(buf),
            Self::Ctr128(c) => c.apply_keystream(buf),
        }
    }

    fn seek(&mut self, offset: u64) {
        match self {
            Self::Ctr64(c) => c.seek(offset),
            Self::Ctr128(c) => c.seek(offset),
        }
    }
}

/// AES-128 CTR. Encryption and decryption are the same operation and the
/// output is always as long as the input.
pub struct CtrStreamCipher {
    key: Key,
    iv: Iv,
    counter: CounterSize,
    offset: u64,
    keystream: Keystream,
}

impl CtrStreamCipher {
    pub fn new(key: &Key, iv: &Iv, counter: CounterSize) -> Self {
        Self {
            key: *key,
            iv: *iv,
            counter,
            offset: 0,
            keystream: Keystream::new(key, iv, counter),
        }
    }
}

impl StreamCipher for CtrStreamCipher {
    fn process_buffer(&mut self, input: &[u8], output: &mut [u8], _is_last: bool) -> Result<usize> {
        check_output(output, input.len())?;
        let output = &mut output[..input.len()];
        output.copy_from_slice(input);
        self.keystream.apply(output);
        self.offset += input.len() as u64;
        Ok(input.len())
    }

    fn output_size(&self, input_size: usize, _is_last: bool) -> usize {
        input_size
    }

    fn set_stream_offset(&mut self, offset: u64) -> Result<()> {
        self.keystream.seek(offset);
        self.offset = offset;
        Ok(())
    }

    fn stream_offset(&self) -> u64 {
        self.offset
    }

    fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.iv = parse_iv(iv)?;
        self.keystream = Keystream::new(&self.key, &self.iv, self.counter);
        self.offset = 0;
        Ok(())
    }

    fn iv(&self) -> &Iv {
        &self.iv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const IV: &str = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff";

    fn cipher(counter: CounterSize) -> CtrStreamCipher {
        let key: Key = hex::decode(KEY).unwrap().try_into().unwrap();
        let iv: Iv = hex::decode(IV).unwrap().try_into().unwrap();
        CtrStreamCipher::new(&key, &iv, counter)
    }

    #[test]
    fn test_known_answer() {
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let out = cipher(CounterSize::Bytes16).process(&plain, true).unwrap();
        assert_eq!(hex::encode(out), "874d6191b620e3261bef6864990db6ce");
    }

    #[test]
    fn test_split_calls_match_one_shot() {
        let data: Vec<u8> = (0..100u8).collect();
        let whole = cipher(CounterSize::Bytes8).process(&data, true).unwrap();

        let mut c = cipher(CounterSize::Bytes8);
        let mut pieces = Vec::new();
        for chunk in data.chunks(7) {
            pieces.extend(c.process(chunk, false).unwrap());
        }
        assert_eq!(pieces, whole);
        assert_eq!(c.stream_offset(), 100);

        let mut c = cipher(CounterSize::Bytes8);
        c.set_stream_offset(37).unwrap();
        assert_eq!(c.process(&data[37..], true).unwrap(), whole[37..]);
    }

    #[test]
    fn test_counter_width() {
        // the low 64 bits are all ones, so the second block differs
        let iv = [0xFFu8; 16];
        let key = [7u8; 16];
        let data = [0u8; 32];
        let narrow = CtrStreamCipher::new(&key, &iv, CounterSize::Bytes8).process(&data, true).unwrap();
        let wide = CtrStreamCipher::new(&key, &iv, CounterSize::Bytes16).process(&data, true).unwrap();
        assert_eq!(narrow[..16], wide[..16]);
        assert_ne!(narrow[16..], wide[16..]);
    }

    #[test]
    fn test_small_output() {
        let mut c = cipher(CounterSize::Bytes8);
        let err = c.process_buffer(&[0; 20], &mut [0; 10], false).unwrap_err();
        assert!(matches!(err, crate::Error::BufferTooSmall { required: 20 }));
        assert_eq!(c.stream_offset(), 0);
    }

    #[test]
    fn test_set_iv_restarts() {
        let mut c = cipher(CounterSize::Bytes8);
        let first = c.process(&[1; 16], false).unwrap();
        c.set_iv(&hex::decode(IV).unwrap()).unwrap();
        assert_eq!(c.stream_offset(), 0);
        assert_eq!(c.process(&[1; 16], false).unwrap(), first);
        assert!(c.set_iv(&[0; 8]).is_err());
    }
}
