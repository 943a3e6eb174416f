//! Stream filter codecs. The object core treats stream payloads as
//! opaque; these are only applied when a caller asks for decoded bytes,
//! when the writer recompresses, and for the self-describing xref and
//! object streams.

#![allow(clippy::many_single_char_names)]

use crate::error::*;
use crate::object::Resolve;
use crate::primitive::{Dictionary, Primitive};

use itertools::Itertools;
use std::convert::TryInto;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorParams {
    pub predictor: i64,
    pub n_components: i64,
    pub bits_per_component: i64,
    pub columns: i64,
    pub early_change: i64,
}

impl Default for PredictorParams {
    fn default() -> PredictorParams {
        PredictorParams { predictor: 1, n_components: 1, bits_per_component: 8, columns: 1, early_change: 1 }
    }
}

impl PredictorParams {
    fn from_dict(dict: &Dictionary, r: &impl Resolve) -> Result<PredictorParams> {
        let mut p = PredictorParams::default();
        let get = |key: &str, default: i64| -> Result<i64> {
            match dict.get(key) {
                Some(v) => r.resolve_deref(v.clone())?.as_integer(),
                None => Ok(default),
            }
        };
        p.predictor = get("Predictor", 1)?;
        p.n_components = get("Colors", 1)?;
        p.bits_per_component = get("BitsPerComponent", 8)?;
        p.columns = get("Columns", 1)?;
        p.early_change = get("EarlyChange", 1)?;
        Ok(p)
    }
    pub fn bytes_per_pixel(&self) -> usize {
        ((self.n_components * self.bits_per_component + 7) / 8).max(1) as usize
    }
    pub fn row_length(&self) -> usize {
        ((self.columns * self.n_components * self.bits_per_component + 7) / 8).max(1) as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFilter {
    AsciiHex,
    Ascii85,
    Lzw(PredictorParams),
    Flate(PredictorParams),
    RunLength,
    Dct,
    Jpx,
    Jbig2,
    CcittFax,
    Crypt,
}

impl StreamFilter {
    pub fn from_kind_and_params(kind: &str, params: &Dictionary, r: &impl Resolve) -> Result<StreamFilter> {
        Ok(match kind {
            "ASCIIHexDecode" | "AHx" => StreamFilter::AsciiHex,
            "ASCII85Decode" | "A85" => StreamFilter::Ascii85,
            "LZWDecode" | "LZW" => StreamFilter::Lzw(PredictorParams::from_dict(params, r)?),
            "FlateDecode" | "Fl" => StreamFilter::Flate(PredictorParams::from_dict(params, r)?),
            "RunLengthDecode" | "RL" => StreamFilter::RunLength,
            "DCTDecode" | "DCT" => StreamFilter::Dct,
            "JPXDecode" => StreamFilter::Jpx,
            "JBIG2Decode" => StreamFilter::Jbig2,
            "CCITTFaxDecode" | "CCF" => StreamFilter::CcittFax,
            "Crypt" => StreamFilter::Crypt,
            ty => bail!("Unrecognized filter type {:?}", ty),
        })
    }

    pub fn pdf_name(&self) -> &'static str {
        match self {
            StreamFilter::AsciiHex => "ASCIIHexDecode",
            StreamFilter::Ascii85 => "ASCII85Decode",
            StreamFilter::Lzw(_) => "LZWDecode",
            StreamFilter::Flate(_) => "FlateDecode",
            StreamFilter::RunLength => "RunLengthDecode",
            StreamFilter::Dct => "DCTDecode",
            StreamFilter::Jpx => "JPXDecode",
            StreamFilter::Jbig2 => "JBIG2Decode",
            StreamFilter::CcittFax => "CCITTFaxDecode",
            StreamFilter::Crypt => "Crypt",
        }
    }

    /// Generalized filters encode arbitrary bytes; specialized ones are
    /// image codecs whose output is not the original payload.
    pub fn is_generalized(&self) -> bool {
        matches!(
            self,
            StreamFilter::AsciiHex
                | StreamFilter::Ascii85
                | StreamFilter::Lzw(_)
                | StreamFilter::Flate(_)
                | StreamFilter::RunLength
        )
    }
}

/// Read `/Filter` and `/DecodeParms` off a stream dictionary.
pub fn filters_of(dict: &Dictionary, r: &impl Resolve) -> Result<Vec<StreamFilter>> {
    let filter = match dict.get("Filter") {
        Some(f) => t!(r.resolve_deref(f.clone())),
        None => return Ok(Vec::new()),
    };
    let params = match dict.get("DecodeParms").or_else(|| dict.get("DP")) {
        Some(p) => t!(r.resolve_deref(p.clone())),
        None => Primitive::Null,
    };
    let names: Vec<String> = match filter {
        Primitive::Name(n) => vec![n.as_str().into()],
        Primitive::Array(arr) => {
            let mut v = Vec::with_capacity(arr.len());
            for p in arr {
                v.push(t!(r.resolve_deref(p)).into_name()?.as_str().into());
            }
            v
        }
        Primitive::Null => return Ok(Vec::new()),
        p => err!(PdfError::UnexpectedPrimitive { expected: "Name or Array", found: p.get_debug_name() }),
    };
    let params: Vec<Dictionary> = match params {
        Primitive::Dictionary(d) => vec![d],
        Primitive::Array(arr) => {
            let mut v = Vec::with_capacity(arr.len());
            for p in arr {
                v.push(match t!(r.resolve_deref(p)) {
                    Primitive::Dictionary(d) => d,
                    _ => Dictionary::new(),
                });
            }
            v
        }
        _ => Vec::new(),
    };
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let empty = Dictionary::new();
            let param = params.get(i).unwrap_or(&empty);
            StreamFilter::from_kind_and_params(name, param, r)
        })
        .collect()
}

/// Apply the inverse of one filter.
pub fn decode(data: &[u8], filter: &StreamFilter) -> Result<Vec<u8>> {
    match *filter {
        StreamFilter::AsciiHex => decode_hex(data),
        StreamFilter::Ascii85 => decode_85(data),
        StreamFilter::Lzw(ref params) => {
            let decoded = lzw_decode(data, params.early_change != 0)?;
            unpredict(decoded, params)
        }
        StreamFilter::Flate(ref params) => {
            let decoded = flate_decode(data)?;
            unpredict(decoded, params)
        }
        StreamFilter::RunLength => decode_run_length(data),
        // image codecs pass through; the payload is not ours to interpret
        StreamFilter::Dct | StreamFilter::Jpx | StreamFilter::Jbig2 | StreamFilter::CcittFax => {
            Ok(data.to_vec())
        }
        StreamFilter::Crypt => Ok(data.to_vec()),
    }
}

/// Apply one generalized filter in the forward direction.
pub fn encode(data: &[u8], filter: &StreamFilter) -> Result<Vec<u8>> {
    match *filter {
        StreamFilter::AsciiHex => {
            let mut out = encode_hex(data);
            out.push(b'>');
            Ok(out)
        }
        StreamFilter::Ascii85 => Ok(encode_85(data)),
        StreamFilter::Flate(ref params) => {
            let predicted = predict(data, params)?;
            Ok(flate_encode(&predicted))
        }
        ref f => bail!("encoding with {:?} is not supported", f),
    }
}

//////////////////////
// Flate

pub fn flate_decode(data: &[u8]) -> Result<Vec<u8>> {
    // zlib wrapper first; some producers emit raw deflate
    let mut out = Vec::new();
    match libflate::zlib::Decoder::new(data) {
        Ok(mut dec) => {
            if dec.read_to_end(&mut out).is_ok() {
                return Ok(out);
            }
        }
        Err(_) => {}
    }
    out.clear();
    let mut dec = libflate::deflate::Decoder::new(data);
    dec.read_to_end(&mut out).map_err(|e| PdfError::Inflate { msg: e.to_string() })?;
    Ok(out)
}

pub fn flate_encode(data: &[u8]) -> Vec<u8> {
    deflate::deflate_bytes_zlib(data)
}

//////////////////////
// LZW

fn lzw_decode(data: &[u8], early_change: bool) -> Result<Vec<u8>> {
    let mut decoder = if early_change {
        weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
    } else {
        weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8)
    };
    let mut out = Vec::new();
    decoder.into_stream(&mut out).decode_all(data).status.map_err(|e| PdfError::Inflate { msg: e.to_string() })?;
    Ok(out)
}

//////////////////////
// PNG predictor

pub fn unpredict(data: Vec<u8>, params: &PredictorParams) -> Result<Vec<u8>> {
    match params.predictor {
        1 => Ok(data),
        2 => tiff_unpredict(data, params),
        10..=15 => png_unpredict(data, params),
        n => Err(PdfError::IncorrectPredictorType { n: n as u8 }),
    }
}

fn tiff_unpredict(mut data: Vec<u8>, params: &PredictorParams) -> Result<Vec<u8>> {
    if params.bits_per_component != 8 {
        bail!("TIFF predictor with {} bits per component", params.bits_per_component);
    }
    let bpp = params.bytes_per_pixel();
    let row_len = params.row_length();
    for row in data.chunks_mut(row_len) {
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
    }
    Ok(data)
}

fn png_unpredict(data: Vec<u8>, params: &PredictorParams) -> Result<Vec<u8>> {
    let bpp = params.bytes_per_pixel();
    let row_len = params.row_length();
    let stride = row_len + 1;
    if data.len() % stride != 0 {
        warn!("predictor data is not a whole number of rows, truncating");
    }
    let mut out = Vec::with_capacity(data.len() / stride * row_len);
    let mut prior = vec![0u8; row_len];

    for chunk in data.chunks_exact(stride) {
        let tag = chunk[0];
        let mut row = chunk[1..].to_vec();
        match tag {
            0 => {}
            1 => {
                for i in bpp..row_len {
                    row[i] = row[i].wrapping_add(row[i - bpp]);
                }
            }
            2 => {
                for i in 0..row_len {
                    row[i] = row[i].wrapping_add(prior[i]);
                }
            }
            3 => {
                for i in 0..row_len {
                    let left = if i >= bpp { row[i - bpp] as u16 } else { 0 };
                    row[i] = row[i].wrapping_add(((left + prior[i] as u16) / 2) as u8);
                }
            }
            4 => {
                for i in 0..row_len {
                    let a = if i >= bpp { row[i - bpp] } else { 0 };
                    let b = prior[i];
                    let c = if i >= bpp { prior[i - bpp] } else { 0 };
                    row[i] = row[i].wrapping_add(paeth(a, b, c));
                }
            }
            n => err!(PdfError::IncorrectPredictorType { n }),
        }
        out.extend_from_slice(&row);
        prior.copy_from_slice(&row);
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Forward prediction. Only PNG-Up (predictor 12) is ever emitted, for
/// xref streams.
pub fn predict(data: &[u8], params: &PredictorParams) -> Result<Vec<u8>> {
    match params.predictor {
        1 => Ok(data.to_vec()),
        12 => {
            let row_len = params.row_length();
            let mut out = Vec::with_capacity(data.len() + data.len() / row_len + 1);
            let mut prior = vec![0u8; row_len];
            for row in data.chunks(row_len) {
                out.push(2);
                for (i, &b) in row.iter().enumerate() {
                    out.push(b.wrapping_sub(prior[i]));
                }
                prior[..row.len()].copy_from_slice(row);
            }
            Ok(out)
        }
        n => Err(PdfError::IncorrectPredictorType { n: n as u8 }),
    }
}

//////////////////////
// RunLength

fn decode_run_length(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let n = *data.get(i).ok_or(PdfError::EOF)?;
        i += 1;
        match n {
            128 => break,
            0..=127 => {
                let count = n as usize + 1;
                let chunk = data.get(i..i + count).ok_or(PdfError::EOF)?;
                out.extend_from_slice(chunk);
                i += count;
            }
            129..=255 => {
                let b = *data.get(i).ok_or(PdfError::EOF)?;
                i += 1;
                out.extend(std::iter::repeat(b).take(257 - n as usize));
            }
        }
    }
    Ok(out)
}

//////////////////////
// Hex and Ascii85

#[inline]
pub fn decode_nibble(c: u8) -> Option<u8> {
    match c {
        n @ b'0'..=b'9' => Some(n - b'0'),
        a @ b'a'..=b'f' => Some(a - b'a' + 0xa),
        a @ b'A'..=b'F' => Some(a - b'A' + 0xA),
        _ => None,
    }
}

#[inline]
fn encode_nibble(c: u8) -> u8 {
    match c {
        0..=9 => b'0' + c,
        10..=15 => b'a' - 10 + c,
        _ => unreachable!(),
    }
}

pub fn decode_hex(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let pairs = data
        .iter()
        .cloned()
        .take_while(|&b| b != b'>')
        .filter(|&b| !matches!(b, 0 | 9 | 10 | 12 | 13 | 32))
        .tuples();
    for (i, (high, low)) in pairs.enumerate() {
        if let (Some(low), Some(high)) = (decode_nibble(low), decode_nibble(high)) {
            out.push(high << 4 | low);
        } else {
            return Err(PdfError::HexDecode { pos: i * 2, bytes: [high, low] });
        }
    }
    Ok(out)
}

pub fn encode_hex(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() * 2);
    for &b in data {
        buf.push(encode_nibble(b >> 4));
        buf.push(encode_nibble(b & 0xf));
    }
    buf
}

#[inline]
fn sym_85(byte: u8) -> Option<u8> {
    match byte {
        b @ 0x21..=0x75 => Some(b - 0x21),
        _ => None,
    }
}

fn word_85([a, b, c, d, e]: [u8; 5]) -> Option<[u8; 4]> {
    fn s(b: u8) -> Option<u32> {
        sym_85(b).map(|n| n as u32)
    }
    let (a, b, c, d, e) = (s(a)?, s(b)?, s(c)?, s(d)?, s(e)?);
    let q = (((a * 85 + b) * 85 + c) * 85 + d) * 85 + e;
    Some(q.to_be_bytes())
}

pub fn decode_85(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((data.len() + 4) / 5 * 4);

    let mut stream = data.iter().cloned().filter(|&b| !matches!(b, b' ' | b'\n' | b'\r' | b'\t'));
    let mut symbols = stream.by_ref().take_while(|&b| b != b'~');

    let (tail_len, tail) = loop {
        match symbols.next() {
            Some(b'z') => out.extend_from_slice(&[0; 4]),
            Some(a) => {
                let (b, c, d, e) = match (symbols.next(), symbols.next(), symbols.next(), symbols.next()) {
                    (Some(b), Some(c), Some(d), Some(e)) => (b, c, d, e),
                    (None, _, _, _) => break (1, [a, b'u', b'u', b'u', b'u']),
                    (Some(b), None, _, _) => break (2, [a, b, b'u', b'u', b'u']),
                    (Some(b), Some(c), None, _) => break (3, [a, b, c, b'u', b'u']),
                    (Some(b), Some(c), Some(d), None) => break (4, [a, b, c, d, b'u']),
                };
                out.extend_from_slice(&word_85([a, b, c, d, e]).ok_or(PdfError::Ascii85TailError)?);
            }
            None => break (0, [b'u'; 5]),
        }
    };

    if tail_len > 0 {
        let last = word_85(tail).ok_or(PdfError::Ascii85TailError)?;
        out.extend_from_slice(&last[..tail_len - 1]);
    }

    match (stream.next(), stream.next()) {
        (Some(b'>'), None) => Ok(out),
        _ => Err(PdfError::Ascii85TailError),
    }
}

#[inline]
fn divmod(n: u32, m: u32) -> (u32, u32) {
    (n / m, n % m)
}

#[inline]
fn a85(n: u32) -> u8 {
    n as u8 + 0x21
}

#[inline]
fn base85_chunk(c: [u8; 4]) -> [u8; 5] {
    let n = u32::from_be_bytes(c);
    let (n, e) = divmod(n, 85);
    let (n, d) = divmod(n, 85);
    let (n, c) = divmod(n, 85);
    let (a, b) = divmod(n, 85);
    [a85(a), a85(b), a85(c), a85(d), a85(e)]
}

pub fn encode_85(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity((data.len() / 4) * 5 + 10);
    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        let c: [u8; 4] = chunk.try_into().unwrap();
        if c == [0; 4] {
            buf.push(b'z');
        } else {
            buf.extend_from_slice(&base85_chunk(c));
        }
    }
    let r = chunks.remainder();
    if !r.is_empty() {
        let mut c = [0; 4];
        c[..r.len()].copy_from_slice(r);
        let out = base85_chunk(c);
        buf.extend_from_slice(&out[..r.len() + 1]);
    }
    buf.extend_from_slice(b"~>");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flate_roundtrip() {
        let data = b"hello hello hello hello flate".to_vec();
        let enc = flate_encode(&data);
        assert_eq!(flate_decode(&enc).unwrap(), data);
    }

    #[test]
    fn hex_roundtrip() {
        let data = [0u8, 1, 0xab, 0xff];
        let enc = encode_hex(&data);
        assert_eq!(decode_hex(&enc).unwrap(), data);
    }

    #[test]
    fn a85_roundtrip() {
        let data = b"arbitrary \x00\x00\x00\x00 bytes".to_vec();
        let enc = encode_85(&data);
        assert_eq!(decode_85(&enc).unwrap(), data);
    }

    #[test]
    fn run_length() {
        // literal run of 3, replicated run of 4, EOD
        let data = [2u8, b'a', b'b', b'c', 253, b'x', 128];
        assert_eq!(decode_run_length(&data).unwrap(), b"abcxxxx");
    }

    #[test]
    fn png_up_roundtrip() {
        let params = PredictorParams { predictor: 12, columns: 4, ..PredictorParams::default() };
        let data = [1u8, 2, 3, 4, 2, 3, 4, 5, 9, 9, 9, 9];
        let predicted = predict(&data, &params).unwrap();
        assert_eq!(predicted.len(), 15);
        let plain = png_unpredict(predicted, &params).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn flate_with_predictor() {
        let params = PredictorParams { predictor: 12, columns: 5, ..PredictorParams::default() };
        let filter = StreamFilter::Flate(params);
        let data = vec![7u8; 25];
        let enc = encode(&data, &filter).unwrap();
        assert_eq!(decode(&enc, &filter).unwrap(), data);
    }
}
