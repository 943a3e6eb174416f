//! PDF "cryptography" - this is why you don't write your own crypto.
//!
//! Key derivation for the standard security handler, V1 through V5
//! (revisions 2 to 6), per-object keys, and the primitives behind them.
//! The primitives go through a `Crypto` provider so a document can be
//! given a different implementation.

use crate::error::*;
use crate::object::{PlainRef, Resolve};
use crate::parser::StringDecrypter;
use crate::primitive::{Dictionary, Name, PdfString, Primitive};

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use once_cell::sync::Lazy;
use rand::RngCore;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Algorithm 2, step a: passwords are padded to 32 bytes with this.
pub const PAD: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

#[derive(Copy)]
pub struct Rc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}

impl Clone for Rc4 {
    fn clone(&self) -> Rc4 {
        *self
    }
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Rc4 {
        assert!(!key.is_empty() && key.len() <= 256);
        let mut rc4 = Rc4 { i: 0, j: 0, state: [0; 256] };
        for (i, x) in rc4.state.iter_mut().enumerate() {
            *x = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(rc4.state[i]).wrapping_add(key[i % key.len()]);
            rc4.state.swap(i, j as usize);
        }
        rc4
    }
    fn next(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        self.state[(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize]
    }
    /// Stateful processing, for pipelines.
    pub fn process(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next();
        }
    }
    /// One-shot; encryption and decryption are the same operation.
    pub fn apply(key: &[u8], data: &mut [u8]) {
        Rc4::new(key).process(data);
    }
}

////////////////////////////
// The crypto provider seam

/// The primitives the engine needs. One provider per document,
/// defaulting to a process-wide instance.
pub trait Crypto: Send + Sync {
    fn random_bytes(&self, out: &mut [u8]);
    fn md5(&self, data: &[u8]) -> [u8; 16];
    fn sha256(&self, data: &[u8]) -> [u8; 32];
    fn sha384(&self, data: &[u8]) -> [u8; 48];
    fn sha512(&self, data: &[u8]) -> [u8; 64];
    fn rc4(&self, key: &[u8], data: &mut [u8]);
    fn aes_cbc_nopad_encrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>>;
    fn aes_cbc_nopad_decrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>>;
    fn aes_ecb_encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
    fn aes_ecb_decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
}

/// Pure-software provider on the crate's own dependency stack.
pub struct SoftwareCrypto;

impl Crypto for SoftwareCrypto {
    fn random_bytes(&self, out: &mut [u8]) {
        rand::thread_rng().fill_bytes(out);
    }
    fn md5(&self, data: &[u8]) -> [u8; 16] {
        *md5::compute(data)
    }
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        use sha2::Digest;
        sha2::Sha256::digest(data).into()
    }
    fn sha384(&self, data: &[u8]) -> [u8; 48] {
        use sha2::Digest;
        sha2::Sha384::digest(data).into()
    }
    fn sha512(&self, data: &[u8]) -> [u8; 64] {
        use sha2::Digest;
        sha2::Sha512::digest(data).into()
    }
    fn rc4(&self, key: &[u8], data: &mut [u8]) {
        Rc4::apply(key, data);
    }
    fn aes_cbc_nopad_encrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 16 != 0 {
            err!(PdfError::DecryptionFailure);
        }
        Ok(match key.len() {
            16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| PdfError::DecryptionFailure)?
                .encrypt_padded_vec_mut::<NoPadding>(data),
            32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| PdfError::DecryptionFailure)?
                .encrypt_padded_vec_mut::<NoPadding>(data),
            _ => err!(PdfError::DecryptionFailure),
        })
    }
    fn aes_cbc_nopad_decrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 16 != 0 {
            err!(PdfError::DecryptionFailure);
        }
        Ok(match key.len() {
            16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| PdfError::DecryptionFailure)?
                .decrypt_padded_vec_mut::<NoPadding>(data)
                .map_err(|_| PdfError::DecryptionFailure)?,
            32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| PdfError::DecryptionFailure)?
                .decrypt_padded_vec_mut::<NoPadding>(data)
                .map_err(|_| PdfError::DecryptionFailure)?,
            _ => err!(PdfError::DecryptionFailure),
        })
    }
    fn aes_ecb_encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if key.len() != 32 || data.len() % 16 != 0 {
            err!(PdfError::DecryptionFailure);
        }
        Ok(ecb::Encryptor::<aes::Aes256>::new_from_slice(key)
            .map_err(|_| PdfError::DecryptionFailure)?
            .encrypt_padded_vec_mut::<NoPadding>(data))
    }
    fn aes_ecb_decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if key.len() != 32 || data.len() % 16 != 0 {
            err!(PdfError::DecryptionFailure);
        }
        ecb::Decryptor::<aes::Aes256>::new_from_slice(key)
            .map_err(|_| PdfError::DecryptionFailure)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| PdfError::DecryptionFailure)
    }
}

static DEFAULT_CRYPTO: Lazy<RwLock<Arc<dyn Crypto>>> =
    Lazy::new(|| RwLock::new(Arc::new(SoftwareCrypto)));

/// The provider new documents pick up.
pub fn default_crypto() -> Arc<dyn Crypto> {
    DEFAULT_CRYPTO.read().expect("crypto provider lock").clone()
}
pub fn set_default_crypto(provider: Arc<dyn Crypto>) {
    *DEFAULT_CRYPTO.write().expect("crypto provider lock") = provider;
}

////////////////////////////
// Encryption dictionary

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMethod {
    None,
    Rc4,
    Aesv2,
    Aesv3,
}

/// 7.6.1 Table 20 + 7.6.3.2 Table 21, with the crypt-filter methods
/// already resolved to concrete ciphers.
#[derive(Debug, Clone)]
pub struct CryptDict {
    pub v: i64,
    pub r: i64,
    /// Key length in bytes.
    pub key_len: usize,
    pub p: i32,
    pub o: Vec<u8>,
    pub u: Vec<u8>,
    pub oe: Vec<u8>,
    pub ue: Vec<u8>,
    pub perms: Vec<u8>,
    pub encrypt_metadata: bool,
    pub stm_method: CryptMethod,
    pub str_method: CryptMethod,
    pub ef_method: CryptMethod,
}

impl CryptDict {
    pub fn from_dict(dict: &Dictionary, r: &impl Resolve) -> Result<CryptDict> {
        let get = |key: &str| -> Result<Option<Primitive>> {
            match dict.get(key) {
                Some(p) => Ok(Some(t!(r.resolve_deref(p.clone())))),
                None => Ok(None),
            }
        };
        if let Some(p) = get("Filter")? {
            let name = p.as_name()?.to_owned();
            if name != "Standard" {
                bail!("unsupported security handler /{}", name);
            }
        }
        let v = try_opt!(get("V")?).as_integer()?;
        let rev = try_opt!(get("R")?).as_integer()?;
        let bits = match get("Length")? {
            Some(p) => p.as_integer()?,
            None => 40,
        };
        if !(40..=256).contains(&bits) || bits % 8 != 0 {
            bail!("invalid /Length {}", bits);
        }
        let p = try_opt!(get("P")?).as_integer()? as i32;
        let string_of = |key: &str| -> Result<Vec<u8>> {
            Ok(match get(key)? {
                Some(p) => p.into_string()?.into_bytes(),
                None => Vec::new(),
            })
        };
        let o = string_of("O")?;
        let u = string_of("U")?;
        let oe = string_of("OE")?;
        let ue = string_of("UE")?;
        let perms = string_of("Perms")?;
        let encrypt_metadata = match get("EncryptMetadata")? {
            Some(p) => p.as_bool()?,
            None => true,
        };

        let (mut stm_method, mut str_method, mut ef_method) = match v {
            1 | 2 => (CryptMethod::Rc4, CryptMethod::Rc4, CryptMethod::Rc4),
            4 | 5 => (CryptMethod::None, CryptMethod::None, CryptMethod::None),
            _ => err!(PdfError::UnsupportedEncryption { v, r: rev }),
        };

        if v >= 4 {
            // /CF maps filter names to methods; /StmF, /StrF and /EFF
            // select which named filter applies where.
            let filters = match get("CF")? {
                Some(p) => p.into_dictionary(r)?,
                None => Dictionary::new(),
            };
            let method_of = |name: &str| -> Result<CryptMethod> {
                if name == "Identity" {
                    return Ok(CryptMethod::None);
                }
                let f = match filters.get(name) {
                    Some(f) => t!(r.resolve_deref(f.clone())).into_dictionary(r)?,
                    None => {
                        warn!("crypt filter /{} not defined, treating as Identity", name);
                        return Ok(CryptMethod::None);
                    }
                };
                Ok(match f.get("CFM").map(|m| m.as_name()).transpose()? {
                    Some("None") | None => CryptMethod::None,
                    Some("V2") => CryptMethod::Rc4,
                    Some("AESV2") => CryptMethod::Aesv2,
                    Some("AESV3") => CryptMethod::Aesv3,
                    Some(m) => bail!("unknown crypt method /{}", m),
                })
            };
            let selector = |key: &str| -> Result<String> {
                Ok(match get(key)? {
                    Some(p) => p.into_name()?.as_str().to_owned(),
                    None => "Identity".into(),
                })
            };
            stm_method = method_of(&selector("StmF")?)?;
            str_method = method_of(&selector("StrF")?)?;
            let eff = match get("EFF")? {
                Some(p) => p.into_name()?.as_str().to_owned(),
                None => selector("StmF")?,
            };
            ef_method = method_of(&eff)?;
        }

        let key_len = match v {
            1 => 5,
            5 => 32,
            _ => (bits / 8) as usize,
        };

        Ok(CryptDict {
            v,
            r: rev,
            key_len,
            p,
            o,
            u,
            oe,
            ue,
            perms,
            encrypt_metadata,
            stm_method,
            str_method,
            ef_method,
        })
    }
}

/// Which of the two passwords matched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PasswordMatch {
    User,
    Owner,
}

////////////////////////////
// Shared key derivation

/// Algorithm 2: file key from a (padded) password, V < 5.
fn compute_file_key(crypto: &dyn Crypto, dict: &CryptDict, id0: &[u8], pass: &[u8]) -> Vec<u8> {
    let mut ctx = md5::Context::new();
    if pass.len() < 32 {
        ctx.consume(pass);
        ctx.consume(&PAD[..32 - pass.len()]);
    } else {
        ctx.consume(&pass[..32]);
    }
    ctx.consume(&dict.o[..dict.o.len().min(32)]);
    ctx.consume(dict.p.to_le_bytes());
    ctx.consume(id0);
    if dict.r >= 4 && !dict.encrypt_metadata {
        ctx.consume([0xff, 0xff, 0xff, 0xff]);
    }
    let mut data = *ctx.compute();
    if dict.r >= 3 {
        for _ in 0..50 {
            data = crypto.md5(&data[..dict.key_len]);
        }
    }
    data[..dict.key_len].to_vec()
}

/// Algorithm 4 (R2) / Algorithm 5 (R3+): the /U verification string.
fn compute_u(crypto: &dyn Crypto, dict: &CryptDict, id0: &[u8], key: &[u8]) -> Vec<u8> {
    if dict.r == 2 {
        let mut data = PAD.to_vec();
        crypto.rc4(key, &mut data);
        data
    } else {
        let mut ctx = md5::Context::new();
        ctx.consume(PAD);
        ctx.consume(id0);
        let mut data = ctx.compute().to_vec();
        crypto.rc4(key, &mut data);
        for i in 1u8..=19 {
            let xored: Vec<u8> = key.iter().map(|&b| b ^ i).collect();
            crypto.rc4(&xored, &mut data);
        }
        // 16 bytes of hash plus 16 arbitrary bytes of padding
        data.extend_from_slice(&PAD[..16]);
        data
    }
}

/// Algorithm 3: the /O string, and the RC4 key it is built with.
fn owner_rc4_key(crypto: &dyn Crypto, dict_r: i64, key_len: usize, owner_pass: &[u8]) -> Vec<u8> {
    let mut padded = [0u8; 32];
    let n = owner_pass.len().min(32);
    padded[..n].copy_from_slice(&owner_pass[..n]);
    if n < 32 {
        padded[n..].copy_from_slice(&PAD[..32 - n]);
    }
    let mut digest = crypto.md5(&padded);
    if dict_r >= 3 {
        for _ in 0..50 {
            digest = crypto.md5(&digest);
        }
    }
    digest[..key_len].to_vec()
}

fn compute_o(crypto: &dyn Crypto, dict_r: i64, key_len: usize, owner_pass: &[u8], user_pass: &[u8]) -> Vec<u8> {
    let rc4_key = owner_rc4_key(crypto, dict_r, key_len, owner_pass);
    let mut data = [0u8; 32];
    let n = user_pass.len().min(32);
    data[..n].copy_from_slice(&user_pass[..n]);
    if n < 32 {
        data[n..].copy_from_slice(&PAD[..32 - n]);
    }
    let mut data = data.to_vec();
    crypto.rc4(&rc4_key, &mut data);
    if dict_r >= 3 {
        for i in 1u8..=19 {
            let xored: Vec<u8> = rc4_key.iter().map(|&b| b ^ i).collect();
            crypto.rc4(&xored, &mut data);
        }
    }
    data
}

/// Algorithm 2.B (R6): the iterated hash. `extra` is empty for the user
/// password and `U[0..48]` for the owner password.
fn hash_r6(crypto: &dyn Crypto, pass: &[u8], salted_input: &[u8], extra: &[u8]) -> [u8; 32] {
    let mut k: Vec<u8> = crypto.sha256(salted_input).to_vec();
    let mut round: u32 = 0;
    loop {
        let mut block = Vec::with_capacity(pass.len() + k.len() + extra.len());
        block.extend_from_slice(pass);
        block.extend_from_slice(&k);
        block.extend_from_slice(extra);
        let mut k1 = Vec::with_capacity(block.len() * 64);
        for _ in 0..64 {
            k1.extend_from_slice(&block);
        }
        let iv: [u8; 16] = k[16..32].try_into().expect("k is 32 bytes");
        let e = crypto
            .aes_cbc_nopad_encrypt(&k[..16], &iv, &k1)
            .expect("whole blocks");
        // sum mod 3 equals the big-endian number mod 3 since 256 = 1 (mod 3)
        k = match e[..16].iter().map(|&b| b as u32).sum::<u32>() % 3 {
            0 => crypto.sha256(&e).to_vec(),
            1 => crypto.sha384(&e)[..32].to_vec(),
            _ => crypto.sha512(&e)[..32].to_vec(),
        };
        round += 1;
        if round >= 64 && (*e.last().unwrap() as u32) <= round - 32 {
            break;
        }
    }
    k[..32].try_into().expect("k is 32 bytes")
}

fn hash_v5(crypto: &dyn Crypto, r: i64, pass: &[u8], salt: &[u8], extra: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(pass.len() + salt.len() + extra.len());
    input.extend_from_slice(pass);
    input.extend_from_slice(salt);
    input.extend_from_slice(extra);
    if r == 5 {
        crypto.sha256(&input)
    } else {
        hash_r6(crypto, pass, &input, extra)
    }
}

////////////////////////////
// Decoder (read side)

pub struct Decoder {
    crypto: Arc<dyn Crypto>,
    key: Vec<u8>,
    v: i64,
    r: i64,
    stm_method: CryptMethod,
    str_method: CryptMethod,
    /// Strings inside an indirect /Encrypt dictionary are not encrypted.
    pub encrypt_ref: Option<PlainRef>,
    /// The catalog's /Metadata stream stays plaintext when the dictionary
    /// says so.
    pub metadata_ref: Option<PlainRef>,
    pub encrypt_metadata: bool,
    pub matched: PasswordMatch,
}

impl Decoder {
    /// Password authentication, trying the supplied bytes first and then
    /// alternative encodings (SASLprep for R6, WINDOWS-1252). The error
    /// from the original attempt is surfaced if every attempt fails.
    pub fn from_password(dict: &CryptDict, id0: &[u8], pass: &[u8]) -> Result<Decoder> {
        let crypto = default_crypto();
        let primary = Self::try_password(crypto.clone(), dict, id0, pass);
        let primary_err = match primary {
            Ok(d) => return Ok(d),
            Err(e) => e,
        };
        for alt in alternate_encodings(dict.r, pass) {
            if alt == pass {
                continue;
            }
            if let Ok(d) = Self::try_password(crypto.clone(), dict, id0, &alt) {
                return Ok(d);
            }
        }
        Err(primary_err)
    }

    /// Hex-key mode: the caller supplies the file key itself and password
    /// verification is skipped entirely.
    pub fn from_raw_key(dict: &CryptDict, key: &[u8]) -> Result<Decoder> {
        if key.len() != dict.key_len {
            bail!("key length {} does not match /Length {}", key.len(), dict.key_len);
        }
        Ok(Decoder {
            crypto: default_crypto(),
            key: key.to_vec(),
            v: dict.v,
            r: dict.r,
            stm_method: dict.stm_method,
            str_method: dict.str_method,
            encrypt_ref: None,
            metadata_ref: None,
            encrypt_metadata: dict.encrypt_metadata,
            matched: PasswordMatch::User,
        })
    }

    fn try_password(crypto: Arc<dyn Crypto>, dict: &CryptDict, id0: &[u8], pass: &[u8]) -> Result<Decoder> {
        let (key, matched) = match dict.v {
            1 | 2 | 4 => t!(Self::authenticate_legacy(&*crypto, dict, id0, pass)),
            5 => t!(Self::authenticate_v5(&*crypto, dict, pass)),
            v => err!(PdfError::UnsupportedEncryption { v, r: dict.r }),
        };
        Ok(Decoder {
            crypto,
            key,
            v: dict.v,
            r: dict.r,
            stm_method: dict.stm_method,
            str_method: dict.str_method,
            encrypt_ref: None,
            metadata_ref: None,
            encrypt_metadata: dict.encrypt_metadata,
            matched,
        })
    }

    fn check_user_legacy(crypto: &dyn Crypto, dict: &CryptDict, id0: &[u8], pass: &[u8]) -> Option<Vec<u8>> {
        let key = compute_file_key(crypto, dict, id0, pass);
        let computed = compute_u(crypto, dict, id0, &key);
        let stored = &dict.u;
        let matches = if dict.r == 2 {
            computed.len() == stored.len() && constant_time_eq(&computed, stored)
        } else {
            stored.len() >= 16 && constant_time_eq(&computed[..16], &stored[..16])
        };
        matches.then_some(key)
    }

    fn authenticate_legacy(
        crypto: &dyn Crypto,
        dict: &CryptDict,
        id0: &[u8],
        pass: &[u8],
    ) -> Result<(Vec<u8>, PasswordMatch)> {
        if !matches!(dict.r, 2..=4) {
            err!(PdfError::UnsupportedEncryption { v: dict.v, r: dict.r });
        }
        if let Some(key) = Self::check_user_legacy(crypto, dict, id0, pass) {
            return Ok((key, PasswordMatch::User));
        }
        // Algorithm 7: the owner password recovers the user password.
        let rc4_key = owner_rc4_key(crypto, dict.r, dict.key_len, pass);
        let mut user_pass = dict.o.clone();
        user_pass.truncate(32);
        if dict.r == 2 {
            crypto.rc4(&rc4_key, &mut user_pass);
        } else {
            for i in (0u8..=19).rev() {
                let xored: Vec<u8> = rc4_key.iter().map(|&b| b ^ i).collect();
                crypto.rc4(&xored, &mut user_pass);
            }
        }
        if let Some(key) = Self::check_user_legacy(crypto, dict, id0, &user_pass) {
            return Ok((key, PasswordMatch::Owner));
        }
        Err(PdfError::InvalidPassword)
    }

    /// Algorithm 2.A: V5 validation and key retrieval. The owner
    /// password cannot recover the user password here; it unlocks the
    /// same file key through /OE instead.
    fn authenticate_v5(crypto: &dyn Crypto, dict: &CryptDict, pass: &[u8]) -> Result<(Vec<u8>, PasswordMatch)> {
        if !matches!(dict.r, 5 | 6) {
            err!(PdfError::UnsupportedEncryption { v: dict.v, r: dict.r });
        }
        if dict.u.len() < 48 || dict.o.len() < 48 {
            bail!("V5 /U and /O must be 48 bytes");
        }
        let pass = &pass[..pass.len().min(127)];
        let u_vsalt = &dict.u[32..40];
        let u_ksalt = &dict.u[40..48];
        let o_vsalt = &dict.o[32..40];
        let o_ksalt = &dict.o[40..48];
        let iv0 = [0u8; 16];

        let owner_hash = hash_v5(crypto, dict.r, pass, o_vsalt, &dict.u[..48]);
        if constant_time_eq(&owner_hash, &dict.o[..32]) {
            let ikey = hash_v5(crypto, dict.r, pass, o_ksalt, &dict.u[..48]);
            let key = t!(crypto.aes_cbc_nopad_decrypt(&ikey, &iv0, &dict.oe));
            t!(Self::check_perms(crypto, dict, &key));
            return Ok((key, PasswordMatch::Owner));
        }
        let user_hash = hash_v5(crypto, dict.r, pass, u_vsalt, &[]);
        if constant_time_eq(&user_hash, &dict.u[..32]) {
            let ikey = hash_v5(crypto, dict.r, pass, u_ksalt, &[]);
            let key = t!(crypto.aes_cbc_nopad_decrypt(&ikey, &iv0, &dict.ue));
            t!(Self::check_perms(crypto, dict, &key));
            return Ok((key, PasswordMatch::User));
        }
        Err(PdfError::InvalidPassword)
    }

    /// Algorithm 13: /Perms must round-trip through the file key.
    fn check_perms(crypto: &dyn Crypto, dict: &CryptDict, key: &[u8]) -> Result<()> {
        if dict.perms.len() != 16 {
            warn!("/Perms has {} bytes, expected 16", dict.perms.len());
            return Ok(());
        }
        let plain = t!(crypto.aes_ecb_decrypt(key, &dict.perms));
        if &plain[9..12] != b"adb" {
            err!(PdfError::DecryptionFailure);
        }
        let p = i32::from_le_bytes(plain[..4].try_into().expect("4 bytes"));
        if p != dict.p {
            warn!("/Perms disagrees with /P ({} vs {})", p, dict.p);
        }
        Ok(())
    }

    pub fn file_key(&self) -> &[u8] {
        &self.key
    }

    /// Algorithm 1 / 1.A: per-object key.
    fn object_key(&self, id: PlainRef, aes: bool) -> Vec<u8> {
        if self.v == 5 {
            return self.key.clone();
        }
        let mut data = Vec::with_capacity(self.key.len() + 9);
        data.extend_from_slice(&self.key);
        data.extend_from_slice(&id.id.to_le_bytes()[..3]);
        data.extend_from_slice(&id.gen.to_le_bytes()[..2]);
        if aes {
            data.extend_from_slice(b"sAlT");
        }
        let digest = self.crypto.md5(&data);
        digest[..(self.key.len() + 5).min(16)].to_vec()
    }

    pub fn key_and_method_for_stream(&self, id: PlainRef) -> (CryptMethod, Vec<u8>) {
        if Some(id) == self.metadata_ref && !self.encrypt_metadata {
            return (CryptMethod::None, Vec::new());
        }
        let method = self.stm_method;
        (method, self.object_key(id, method == CryptMethod::Aesv2))
    }

    pub fn decrypt_stream_data(&self, id: PlainRef, data: Vec<u8>) -> Result<Vec<u8>> {
        let (method, key) = self.key_and_method_for_stream(id);
        self.apply_inverse(method, &key, data)
    }

    fn apply_inverse(&self, method: CryptMethod, key: &[u8], mut data: Vec<u8>) -> Result<Vec<u8>> {
        match method {
            CryptMethod::None => Ok(data),
            CryptMethod::Rc4 => {
                self.crypto.rc4(key, &mut data);
                Ok(data)
            }
            CryptMethod::Aesv2 | CryptMethod::Aesv3 => {
                if data.len() < 16 || (data.len() - 16) % 16 != 0 {
                    err!(PdfError::DecryptionFailure);
                }
                let iv: [u8; 16] = data[..16].try_into().expect("16 bytes");
                let plain = t!(self.crypto.aes_cbc_nopad_decrypt(key, &iv, &data[16..]));
                strip_pkcs7(plain)
            }
        }
    }
}

impl StringDecrypter for Decoder {
    fn decrypt_string(&self, id: PlainRef, data: Vec<u8>) -> Result<Vec<u8>> {
        if Some(id) == self.encrypt_ref {
            // Strings inside the /Encrypt dictionary are not encrypted
            return Ok(data);
        }
        if id.id == 0 {
            // direct values outside any object (e.g. trailer /ID) stay as-is
            return Ok(data);
        }
        let method = self.str_method;
        let key = self.object_key(id, method == CryptMethod::Aesv2);
        self.apply_inverse(method, &key, data)
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("v", &self.v)
            .field("r", &self.r)
            .field("stm_method", &self.stm_method)
            .field("str_method", &self.str_method)
            .finish()
    }
}

fn strip_pkcs7(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let n = *data.last().ok_or(PdfError::DecryptionFailure)? as usize;
    if n == 0 || n > 16 || n > data.len() {
        err!(PdfError::DecryptionFailure);
    }
    data.truncate(data.len() - n);
    Ok(data)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// UTF-8 as supplied, then SASLprep (R6 requires it), then WINDOWS-1252,
/// then PDFDocEncoding.
fn alternate_encodings(r: i64, pass: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    if let Ok(s) = std::str::from_utf8(pass) {
        if r == 6 {
            if let Ok(prepped) = stringprep::saslprep(s) {
                out.push(prepped.as_bytes().to_vec());
            }
        }
        let (encoded, _, had_errors) = encoding_rs::WINDOWS_1252.encode(s);
        if !had_errors {
            out.push(encoded.into_owned());
        }
        if let Some(doc) = pdfdoc_encode(s) {
            out.push(doc);
        }
    }
    out
}

/// PDFDocEncoding agrees with Latin-1 except in 0x80..0xA0; map the
/// handful of printable specials and give up on anything else.
fn pdfdoc_encode(s: &str) -> Option<Vec<u8>> {
    s.chars()
        .map(|c| match c {
            '\u{02d8}' => Some(0x18),
            '\u{02c7}' => Some(0x19),
            '\u{02c6}' => Some(0x1a),
            '\u{02d9}' => Some(0x1b),
            '\u{02dd}' => Some(0x1c),
            '\u{02db}' => Some(0x1d),
            '\u{02da}' => Some(0x1e),
            '\u{02dc}' => Some(0x1f),
            '\u{2022}' => Some(0x80),
            '\u{2020}' => Some(0x81),
            '\u{2021}' => Some(0x82),
            '\u{2026}' => Some(0x83),
            '\u{2014}' => Some(0x84),
            '\u{2013}' => Some(0x85),
            '\u{0192}' => Some(0x86),
            '\u{2044}' => Some(0x87),
            '\u{2039}' => Some(0x88),
            '\u{203a}' => Some(0x89),
            '\u{2212}' => Some(0x8a),
            '\u{2030}' => Some(0x8b),
            '\u{201e}' => Some(0x8c),
            '\u{201c}' => Some(0x8d),
            '\u{201d}' => Some(0x8e),
            '\u{2018}' => Some(0x8f),
            '\u{2019}' => Some(0x90),
            '\u{201a}' => Some(0x91),
            '\u{2122}' => Some(0x92),
            '\u{fb01}' => Some(0x93),
            '\u{fb02}' => Some(0x94),
            '\u{0141}' => Some(0x95),
            '\u{0152}' => Some(0x96),
            '\u{0160}' => Some(0x97),
            '\u{0178}' => Some(0x98),
            '\u{017d}' => Some(0x99),
            '\u{0131}' => Some(0x9a),
            '\u{0142}' => Some(0x9b),
            '\u{0153}' => Some(0x9c),
            '\u{0161}' => Some(0x9d),
            '\u{017e}' => Some(0x9e),
            c if (c as u32) < 0x18 || ((c as u32) >= 0x20 && (c as u32) <= 0x7e) => Some(c as u8),
            c if (c as u32) >= 0xa1 && (c as u32) <= 0xff => Some(c as u8),
            _ => None,
        })
        .collect()
}

////////////////////////////
// Encoder (write side)

/// What the writer wants the output encrypted with.
#[derive(Clone, Debug)]
pub struct EncryptionParams {
    pub v: i64,
    pub r: i64,
    /// Key length in bytes.
    pub key_len: usize,
    pub permissions: i32,
    pub user_password: Vec<u8>,
    pub owner_password: Vec<u8>,
    pub encrypt_metadata: bool,
    pub method: CryptMethod,
}

impl EncryptionParams {
    pub fn aes256(user: &[u8], owner: &[u8], permissions: i32) -> EncryptionParams {
        EncryptionParams {
            v: 5,
            r: 6,
            key_len: 32,
            permissions,
            user_password: user.to_vec(),
            owner_password: owner.to_vec(),
            encrypt_metadata: true,
            method: CryptMethod::Aesv3,
        }
    }
    pub fn rc4_128(user: &[u8], owner: &[u8], permissions: i32) -> EncryptionParams {
        EncryptionParams {
            v: 2,
            r: 3,
            key_len: 16,
            permissions,
            user_password: user.to_vec(),
            owner_password: owner.to_vec(),
            encrypt_metadata: true,
            method: CryptMethod::Rc4,
        }
    }
    pub fn aes128(user: &[u8], owner: &[u8], permissions: i32) -> EncryptionParams {
        EncryptionParams {
            v: 4,
            r: 4,
            key_len: 16,
            permissions,
            user_password: user.to_vec(),
            owner_password: owner.to_vec(),
            encrypt_metadata: true,
            method: CryptMethod::Aesv2,
        }
    }
}

/// Derives the verification strings and the file key for the chosen
/// parameters and produces the `/Encrypt` dictionary the writer emits.
pub struct Encoder {
    crypto: Arc<dyn Crypto>,
    key: Vec<u8>,
    v: i64,
    method: CryptMethod,
    dict: Dictionary,
}

impl Encoder {
    pub fn new(params: &EncryptionParams, id0: &[u8]) -> Result<Encoder> {
        let crypto = default_crypto();
        let owner_pass: &[u8] =
            if params.owner_password.is_empty() { &params.user_password } else { &params.owner_password };

        let mut dict = Dictionary::new();
        dict.insert("Filter", Primitive::name("Standard"));
        dict.insert("V", Primitive::Integer(params.v));
        dict.insert("R", Primitive::Integer(params.r));
        dict.insert("P", Primitive::Integer(params.permissions as i64));
        dict.insert("Length", Primitive::Integer((params.key_len * 8) as i64));
        if !params.encrypt_metadata {
            dict.insert("EncryptMetadata", Primitive::Boolean(false));
        }

        let key = match params.v {
            1 | 2 | 4 => {
                let o = compute_o(&*crypto, params.r, params.key_len, owner_pass, &params.user_password);
                let tmp = CryptDict {
                    v: params.v,
                    r: params.r,
                    key_len: params.key_len,
                    p: params.permissions,
                    o: o.clone(),
                    u: Vec::new(),
                    oe: Vec::new(),
                    ue: Vec::new(),
                    perms: Vec::new(),
                    encrypt_metadata: params.encrypt_metadata,
                    stm_method: params.method,
                    str_method: params.method,
                    ef_method: params.method,
                };
                let key = compute_file_key(&*crypto, &tmp, id0, &params.user_password);
                let u = compute_u(&*crypto, &tmp, id0, &key);
                dict.insert("O", Primitive::String(PdfString::new(o)));
                dict.insert("U", Primitive::String(PdfString::new(u)));
                key
            }
            5 => {
                let mut key = vec![0u8; 32];
                crypto.random_bytes(&mut key);
                let mut salts = [0u8; 32];
                crypto.random_bytes(&mut salts);
                let iv0 = [0u8; 16];
                let user_pass = &params.user_password[..params.user_password.len().min(127)];
                let owner_pass = &owner_pass[..owner_pass.len().min(127)];

                // /U then /O, which hashes over U
                let (uv, uk) = (&salts[0..8], &salts[8..16]);
                let mut u = hash_v5(&*crypto, params.r, user_pass, uv, &[]).to_vec();
                u.extend_from_slice(uv);
                u.extend_from_slice(uk);
                let ue = t!(crypto.aes_cbc_nopad_encrypt(
                    &hash_v5(&*crypto, params.r, user_pass, uk, &[]),
                    &iv0,
                    &key
                ));

                let (ov, ok) = (&salts[16..24], &salts[24..32]);
                let mut o = hash_v5(&*crypto, params.r, owner_pass, ov, &u[..48]).to_vec();
                o.extend_from_slice(ov);
                o.extend_from_slice(ok);
                let oe = t!(crypto.aes_cbc_nopad_encrypt(
                    &hash_v5(&*crypto, params.r, owner_pass, ok, &u[..48]),
                    &iv0,
                    &key
                ));

                // Algorithm 10: the /Perms block
                let mut perms = [0u8; 16];
                perms[..4].copy_from_slice(&params.permissions.to_le_bytes());
                perms[4..8].copy_from_slice(&[0xff; 4]);
                perms[8] = if params.encrypt_metadata { b'T' } else { b'F' };
                perms[9..12].copy_from_slice(b"adb");
                crypto.random_bytes(&mut perms[12..16]);
                let perms = t!(crypto.aes_ecb_encrypt(&key, &perms));

                dict.insert("O", Primitive::String(PdfString::new(o)));
                dict.insert("U", Primitive::String(PdfString::new(u)));
                dict.insert("OE", Primitive::String(PdfString::new(oe)));
                dict.insert("UE", Primitive::String(PdfString::new(ue)));
                dict.insert("Perms", Primitive::String(PdfString::new(perms)));
                key
            }
            v => err!(PdfError::UnsupportedEncryption { v, r: params.r }),
        };

        if params.v >= 4 {
            let mut cf = Dictionary::new();
            let mut std_cf = Dictionary::new();
            std_cf.insert("Type", Primitive::name("CryptFilter"));
            std_cf.insert(
                "CFM",
                Primitive::name(match params.method {
                    CryptMethod::Aesv3 => "AESV3",
                    CryptMethod::Aesv2 => "AESV2",
                    CryptMethod::Rc4 => "V2",
                    CryptMethod::None => "None",
                }),
            );
            std_cf.insert("AuthEvent", Primitive::name("DocOpen"));
            std_cf.insert("Length", Primitive::Integer(params.key_len as i64));
            cf.insert("StdCF", Primitive::Dictionary(std_cf));
            dict.insert("CF", Primitive::Dictionary(cf));
            dict.insert("StmF", Primitive::name("StdCF"));
            dict.insert("StrF", Primitive::name("StdCF"));
        }

        Ok(Encoder { crypto, key, v: params.v, method: params.method, dict })
    }

    /// Re-encrypt with the parameters of an existing document: same file
    /// key, same dictionary.
    pub fn from_decoder(decoder: &Decoder, dict: Dictionary) -> Encoder {
        Encoder {
            crypto: decoder.crypto.clone(),
            key: decoder.key.clone(),
            v: decoder.v,
            method: decoder.stm_method,
            dict,
        }
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    pub fn method(&self) -> CryptMethod {
        self.method
    }

    pub fn object_key(&self, id: PlainRef) -> Vec<u8> {
        if self.v == 5 {
            return self.key.clone();
        }
        let mut data = Vec::with_capacity(self.key.len() + 9);
        data.extend_from_slice(&self.key);
        data.extend_from_slice(&id.id.to_le_bytes()[..3]);
        data.extend_from_slice(&id.gen.to_le_bytes()[..2]);
        if self.method == CryptMethod::Aesv2 {
            data.extend_from_slice(b"sAlT");
        }
        let digest = self.crypto.md5(&data);
        digest[..(self.key.len() + 5).min(16)].to_vec()
    }

    pub fn encrypt_string(&self, id: PlainRef, mut data: Vec<u8>) -> Result<Vec<u8>> {
        let key = self.object_key(id);
        match self.method {
            CryptMethod::None => Ok(data),
            CryptMethod::Rc4 => {
                self.crypto.rc4(&key, &mut data);
                Ok(data)
            }
            CryptMethod::Aesv2 | CryptMethod::Aesv3 => {
                let mut iv = [0u8; 16];
                self.crypto.random_bytes(&mut iv);
                crate::pipeline::aes_cbc_encrypt(&key, iv, &data)
            }
        }
    }

    /// Version floor for the chosen cipher.
    pub fn min_pdf_version(&self) -> (u8, u8) {
        match self.method {
            CryptMethod::Aesv3 => (1, 7),
            CryptMethod::Aesv2 => (1, 6),
            _ => (1, 4),
        }
    }
}

pub fn name_of_method(m: CryptMethod) -> Name {
    Name::from(match m {
        CryptMethod::None => "Identity",
        CryptMethod::Rc4 => "V2",
        CryptMethod::Aesv2 => "AESV2",
        CryptMethod::Aesv3 => "AESV3",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_of(encoder: &Encoder) -> CryptDict {
        CryptDict::from_dict(encoder.dict(), &crate::object::NoResolve).unwrap()
    }

    #[test]
    fn rc4_vector() {
        // well-known test vector
        let mut data = b"Plaintext".to_vec();
        Rc4::apply(b"Key", &mut data);
        assert_eq!(data, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    #[test]
    fn legacy_roundtrip_user_and_owner() {
        let params = EncryptionParams::rc4_128(b"user", b"owner", -4);
        let id0 = b"0123456789abcdef";
        let encoder = Encoder::new(&params, id0).unwrap();
        let dict = dict_of(&encoder);

        let d = Decoder::from_password(&dict, id0, b"user").unwrap();
        assert_eq!(d.matched, PasswordMatch::User);
        assert_eq!(d.file_key(), &encoder.key[..]);

        let d = Decoder::from_password(&dict, id0, b"owner").unwrap();
        assert_eq!(d.matched, PasswordMatch::Owner);
        assert_eq!(d.file_key(), &encoder.key[..]);

        assert!(Decoder::from_password(&dict, id0, b"wrong").is_err());
    }

    #[test]
    fn aes256_roundtrip() {
        let params = EncryptionParams::aes256(b"user", b"owner", -4);
        let encoder = Encoder::new(&params, b"").unwrap();
        let dict = dict_of(&encoder);
        assert_eq!(dict.stm_method, CryptMethod::Aesv3);

        let d = Decoder::from_password(&dict, b"", b"user").unwrap();
        assert_eq!(d.matched, PasswordMatch::User);
        assert_eq!(d.file_key(), &encoder.key[..]);

        let d = Decoder::from_password(&dict, b"", b"owner").unwrap();
        assert_eq!(d.matched, PasswordMatch::Owner);
        assert_eq!(d.file_key(), &encoder.key[..]);

        assert!(Decoder::from_password(&dict, b"", b"nope").is_err());
    }

    #[test]
    fn string_roundtrip_aes() {
        let params = EncryptionParams::aes256(b"pw", b"pw", -1);
        let encoder = Encoder::new(&params, b"").unwrap();
        let dict = dict_of(&encoder);
        let decoder = Decoder::from_password(&dict, b"", b"pw").unwrap();

        let id = PlainRef { id: 12, gen: 0 };
        let cipher = encoder.encrypt_string(id, b"secret contents".to_vec()).unwrap();
        assert_ne!(&cipher[16..], b"secret contents");
        let plain = decoder.decrypt_string(id, cipher).unwrap();
        assert_eq!(plain, b"secret contents");
    }

    #[test]
    fn per_object_key_is_salted_and_truncated() {
        let params = EncryptionParams::rc4_128(b"u", b"o", -1);
        let encoder = Encoder::new(&params, b"id").unwrap();
        let k1 = encoder.object_key(PlainRef { id: 1, gen: 0 });
        let k2 = encoder.object_key(PlainRef { id: 2, gen: 0 });
        assert_ne!(k1, k2);
        assert_eq!(k1.len(), 16);
    }

    #[test]
    fn object_key_reference_value() {
        // derive the expected value straight from the algorithm: the key
        // for (id 7, gen 0) is md5(file_key || 07 00 00 || 00 00)
        let params = EncryptionParams::rc4_128(b"u", b"o", -1);
        let encoder = Encoder::new(&params, b"id").unwrap();
        let mut input = encoder.key.clone();
        input.extend_from_slice(&[7, 0, 0, 0, 0]);
        let expected = &md5::compute(&input)[..16];
        assert_eq!(encoder.object_key(PlainRef { id: 7, gen: 0 }), expected);
    }

    #[test]
    fn v5_key_is_file_key() {
        let params = EncryptionParams::aes256(b"u", b"o", -1);
        let encoder = Encoder::new(&params, b"").unwrap();
        assert_eq!(encoder.object_key(PlainRef { id: 99, gen: 1 }), encoder.key);
    }
}
