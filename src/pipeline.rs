//! Byte sinks that compose linearly. The writer pushes stream payloads
//! through a chain built from these: cipher innermost, then compression,
//! then whatever collects or counts the bytes.

use crate::crypt::Rc4;
use crate::enc;
use crate::error::*;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::cell::RefCell;
use std::rc::Rc;

/// A sink with a downstream successor. `finish` flushes buffered state
/// through the rest of the chain and must be called exactly once.
pub trait Pipeline {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Terminal sink collecting into a shared buffer the caller keeps a
/// handle to.
pub struct Buffer {
    data: Rc<RefCell<Vec<u8>>>,
}

impl Buffer {
    pub fn new() -> (Buffer, Rc<RefCell<Vec<u8>>>) {
        let data = Rc::new(RefCell::new(Vec::new()));
        (Buffer { data: data.clone() }, data)
    }
}

impl Pipeline for Buffer {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.borrow_mut().extend_from_slice(data);
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Terminal sink that throws everything away; measuring passes use it
/// under a `Count`.
pub struct Discard;

impl Pipeline for Discard {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counts the bytes flowing through on the way to `next`.
pub struct Count {
    count: Rc<RefCell<usize>>,
    next: Box<dyn Pipeline>,
}

impl Count {
    pub fn new(next: Box<dyn Pipeline>) -> (Count, Rc<RefCell<usize>>) {
        let count = Rc::new(RefCell::new(0));
        (Count { count: count.clone(), next }, count)
    }
}

impl Pipeline for Count {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        *self.count.borrow_mut() += data.len();
        self.next.write(data)
    }
    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

/// Buffers everything, deflates on finish.
pub struct FlateEncode {
    buf: Vec<u8>,
    next: Box<dyn Pipeline>,
}

impl FlateEncode {
    pub fn new(next: Box<dyn Pipeline>) -> FlateEncode {
        FlateEncode { buf: Vec::new(), next }
    }
}

impl Pipeline for FlateEncode {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        let out = enc::flate_encode(&self.buf);
        self.buf = Vec::new();
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// Inverse of `FlateEncode`.
pub struct FlateDecode {
    buf: Vec<u8>,
    next: Box<dyn Pipeline>,
}

impl FlateDecode {
    pub fn new(next: Box<dyn Pipeline>) -> FlateDecode {
        FlateDecode { buf: Vec::new(), next }
    }
}

impl Pipeline for FlateDecode {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        let out = enc::flate_decode(&self.buf)?;
        self.buf = Vec::new();
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// PNG-Up prediction over fixed-width rows, as used by xref streams.
pub struct PredictorEncode {
    columns: usize,
    buf: Vec<u8>,
    next: Box<dyn Pipeline>,
}

impl PredictorEncode {
    pub fn new(columns: usize, next: Box<dyn Pipeline>) -> PredictorEncode {
        PredictorEncode { columns, buf: Vec::new(), next }
    }
}

impl Pipeline for PredictorEncode {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        let params = enc::PredictorParams {
            predictor: 12,
            columns: self.columns as i64,
            ..enc::PredictorParams::default()
        };
        let out = enc::predict(&self.buf, &params)?;
        self.buf = Vec::new();
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// RC4 is a pure stream cipher: encryption and decryption are the same
/// transformation and no buffering is needed.
pub struct Rc4Pipeline {
    cipher: Rc4,
    next: Box<dyn Pipeline>,
}

impl Rc4Pipeline {
    pub fn new(key: &[u8], next: Box<dyn Pipeline>) -> Rc4Pipeline {
        Rc4Pipeline { cipher: Rc4::new(key), next }
    }
}

impl Pipeline for Rc4Pipeline {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        self.cipher.process(&mut buf);
        self.next.write(&buf)
    }
    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-CBC with PKCS#7 padding. The ciphertext is prefixed with the
/// 16-byte IV; a fixed IV can be injected for reproducible output.
pub struct AesEncrypt {
    key: Vec<u8>,
    iv: [u8; 16],
    buf: Vec<u8>,
    next: Box<dyn Pipeline>,
}

impl AesEncrypt {
    pub fn new(key: &[u8], iv: [u8; 16], next: Box<dyn Pipeline>) -> AesEncrypt {
        AesEncrypt { key: key.to_vec(), iv, buf: Vec::new(), next }
    }
}

impl Pipeline for AesEncrypt {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        let out = aes_cbc_encrypt(&self.key, self.iv, &self.buf)?;
        self.buf = Vec::new();
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// Inverse of `AesEncrypt`: strips the IV prefix and the padding.
pub struct AesDecrypt {
    key: Vec<u8>,
    buf: Vec<u8>,
    next: Box<dyn Pipeline>,
}

impl AesDecrypt {
    pub fn new(key: &[u8], next: Box<dyn Pipeline>) -> AesDecrypt {
        AesDecrypt { key: key.to_vec(), buf: Vec::new(), next }
    }
}

impl Pipeline for AesDecrypt {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        let out = aes_cbc_decrypt(&self.key, &self.buf)?;
        self.buf = Vec::new();
        self.next.write(&out)?;
        self.next.finish()
    }
}

pub fn aes_cbc_encrypt(key: &[u8], iv: [u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + data.len() + 16);
    out.extend_from_slice(&iv);
    let ciphertext = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| PdfError::DecryptionFailure)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        32 => Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| PdfError::DecryptionFailure)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        _ => err!(PdfError::DecryptionFailure),
    };
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn aes_cbc_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 || (data.len() - 16) % 16 != 0 {
        err!(PdfError::DecryptionFailure);
    }
    let (iv, ciphertext) = data.split_at(16);
    let out = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| PdfError::DecryptionFailure)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| PdfError::DecryptionFailure)?,
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| PdfError::DecryptionFailure)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| PdfError::DecryptionFailure)?,
        _ => err!(PdfError::DecryptionFailure),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_counts_and_collects() {
        let (buffer, data) = Buffer::new();
        let (mut chain, count) = Count::new(Box::new(buffer));
        chain.write(b"hello ").unwrap();
        chain.write(b"world").unwrap();
        chain.finish().unwrap();
        assert_eq!(*count.borrow(), 11);
        assert_eq!(&*data.borrow(), b"hello world");
    }

    #[test]
    fn flate_chain_roundtrip() {
        let (buffer, compressed) = Buffer::new();
        let mut chain = FlateEncode::new(Box::new(buffer));
        chain.write(b"payload payload payload").unwrap();
        chain.finish().unwrap();

        let (buffer, plain) = Buffer::new();
        let mut chain = FlateDecode::new(Box::new(buffer));
        chain.write(&compressed.borrow()).unwrap();
        chain.finish().unwrap();
        assert_eq!(&*plain.borrow(), b"payload payload payload");
    }

    #[test]
    fn aes_roundtrip_with_iv_prefix() {
        let key = [7u8; 16];
        let data = b"sixteen byte blocks need padding";
        let enc = aes_cbc_encrypt(&key, [9; 16], data).unwrap();
        assert_eq!(&enc[..16], &[9; 16]);
        assert_eq!(aes_cbc_decrypt(&key, &enc).unwrap(), data);
    }

    #[test]
    fn rc4_is_symmetric() {
        let (buffer, enc) = Buffer::new();
        let mut chain = Rc4Pipeline::new(b"key", Box::new(buffer));
        chain.write(b"secret").unwrap();
        chain.finish().unwrap();

        let (buffer, plain) = Buffer::new();
        let mut chain = Rc4Pipeline::new(b"key", Box::new(buffer));
        let data = enc.borrow().clone();
        chain.write(&data).unwrap();
        chain.finish().unwrap();
        assert_eq!(&*plain.borrow(), b"secret");
    }
}
