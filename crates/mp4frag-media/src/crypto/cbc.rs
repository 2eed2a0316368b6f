use super::{check_output, parse_iv, Direction, Iv, Key, Padding, StreamCipher, AES_BLOCK_SIZE};
use crate::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;

enum Chain {
    Encrypt(cbc::Encryptor<Aes128>),
    Decrypt(cbc::Decryptor<Aes128>),
}

impl Chain {
    fn new(direction: Direction, key: &Key, iv: &Iv) -> Self {
        let (key, iv) = (GenericArray::from_slice(key), GenericArray::from_slice(iv));
        match direction {
            Direction::Encrypt => Self::Encrypt(cbc::Encryptor::new(key, iv)),
            Direction::Decrypt => Self::Decrypt(cbc::Decryptor::new(key, iv)),
        }
    }

    fn apply(&mut self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Encrypt(c) => c.encrypt_block_mut(block),
            Self::Decrypt(c) => c.decrypt_block_mut(block),
        }
    }
}

/// AES-128 CBC.
///
/// Input that does not fill a block is held until the next call. A
/// padded decryptor also holds back its last whole block, since only the
/// final call may strip padding.
pub struct CbcStreamCipher {
    key: Key,
    iv: Iv,
    direction: Direction,
    padding: Padding,
    chain: Chain,
    pending: Vec<u8>,
    offset: u64,
    finished: bool,
}

impl CbcStreamCipher {
    pub fn new(key: &Key, iv: &Iv, direction: Direction, padding: Padding) -> Self {
        Self {
            key: *key,
            iv: *iv,
            direction,
            padding,
            chain: Chain::new(direction, key, iv),
            pending: Vec::with_capacity(AES_BLOCK_SIZE * 2),
            offset: 0,
            finished: false,
        }
    }

    fn strips_padding(&self) -> bool {
        self.direction == Direction::Decrypt && self.padding == Padding::Pkcs7
    }

    fn reset(&mut self) {
        self.chain = Chain::new(self.direction, &self.key, &self.iv);
        self.pending.clear();
        self.offset = 0;
        self.finished = false;
    }
}

impl StreamCipher for CbcStreamCipher {
    fn process_buffer(&mut self, input: &[u8], output: &mut [u8], is_last: bool) -> Result<usize> {
        if self.finished {
            return Err(Error::invalid_state("cbc cipher already processed its last buffer"));
        }
        check_output(output, self.output_size(input.len(), is_last))?;

        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);
        if is_last {
            let tail = data.len() % AES_BLOCK_SIZE;
            if self.direction == Direction::Encrypt && self.padding == Padding::Pkcs7 {
                let pad = AES_BLOCK_SIZE - tail;
                data.resize(data.len() + pad, pad as u8);
            } else if tail != 0 {
                return Err(Error::invalid_parameters(format!(
                    "cbc input of {} bytes is not a multiple of the block size",
                    self.offset + input.len() as u64
                )));
            }
        } else {
            let mut keep = data.len() % AES_BLOCK_SIZE;
            if keep == 0 && !data.is_empty() && self.strips_padding() {
                keep = AES_BLOCK_SIZE;
            }
            self.pending = data.split_off(data.len() - keep);
        }
        self.offset += input.len() as u64;

        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.chain.apply(block);
        }

        let mut len = data.len();
        if is_last {
            self.finished = true;
            if self.strips_padding() {
                let pad = data.last().copied().unwrap_or(0) as usize;
                if pad == 0 || pad > AES_BLOCK_SIZE {
                    return Err(Error::invalid_format(format!("invalid cbc padding byte {pad}")));
                }
                len -= pad;
            }
        }
        output[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn output_size(&self, input_size: usize, is_last: bool) -> usize {
        let total = self.pending.len() + input_size;
        let blocks = total / AES_BLOCK_SIZE;
        match (self.direction, self.padding, is_last) {
            (Direction::Encrypt, Padding::Pkcs7, true) => (blocks + 1) * AES_BLOCK_SIZE,
            (Direction::Decrypt, Padding::Pkcs7, false) if total % AES_BLOCK_SIZE == 0 => {
                blocks.saturating_sub(1) * AES_BLOCK_SIZE
            }
            _ => blocks * AES_BLOCK_SIZE,
        }
    }

    /// Only a restart at offset 0 is possible without the previous block.
    fn set_stream_offset(&mut self, offset: u64) -> Result<()> {
        if offset != 0 {
            return Err(Error::not_supported("cbc cipher can only seek to offset 0"));
        }
        self.reset();
        Ok(())
    }

    fn stream_offset(&self) -> u64 {
        self.offset
    }

    fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.iv = parse_iv(iv)?;
        self.reset();
        Ok(())
    }

    fn iv(&self) -> &Iv {
        &self.iv
    }
}
