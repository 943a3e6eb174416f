//! Scanners for the two PDF string syntaxes. Both take the buffer
//! starting right after the opening delimiter and report how many bytes
//! they consumed (including the closing delimiter).

use crate::error::*;

/// Literal string `(...)`: balanced parens, backslash escapes, octal
/// codes. Returns the unescaped bytes and the number of bytes consumed.
pub fn scan_literal_string(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut depth = 0i32;

    macro_rules! take {
        () => {{
            let &b = buf.get(pos).ok_or(PdfError::EOF)?;
            pos += 1;
            b
        }};
    }

    loop {
        match take!() {
            b'(' => {
                depth += 1;
                out.push(b'(');
            }
            b')' => {
                if depth == 0 {
                    return Ok((out, pos));
                }
                depth -= 1;
                out.push(b')');
            }
            b'\\' => match take!() {
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                b't' => out.push(b'\t'),
                b'b' => out.push(b'\x08'),
                b'f' => out.push(b'\x0c'),
                b'(' => out.push(b'('),
                b')' => out.push(b')'),
                b'\\' => out.push(b'\\'),
                // line continuation: backslash-EOL disappears
                b'\n' => {}
                b'\r' => {
                    if buf.get(pos) == Some(&b'\n') {
                        pos += 1;
                    }
                }
                c @ b'0'..=b'7' => {
                    // 1 to 3 octal digits; overflow beyond one byte is
                    // truncated, matching what viewers do
                    let mut code = (c - b'0') as u16;
                    for _ in 0..2 {
                        match buf.get(pos) {
                            Some(&d @ b'0'..=b'7') => {
                                code = code * 8 + (d - b'0') as u16;
                                pos += 1;
                            }
                            _ => break,
                        }
                    }
                    out.push(code as u8);
                }
                // unknown escape: the backslash is dropped
                other => out.push(other),
            },
            // EOLs inside a string are normalized to LF
            b'\r' => {
                if buf.get(pos) == Some(&b'\n') {
                    pos += 1;
                }
                out.push(b'\n');
            }
            c => out.push(c),
        }
    }
}

/// Hex string `<...>`: whitespace ignored, an odd trailing nibble counts
/// as its high half.
pub fn scan_hex_string(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut nibble: Option<u8> = None;

    loop {
        let &b = buf.get(pos).ok_or(PdfError::EOF)?;
        pos += 1;
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 0xa,
            b'A'..=b'F' => b - b'A' + 0xA,
            b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' | 0 => continue,
            b'>' => {
                if let Some(high) = nibble {
                    out.push(high << 4);
                }
                return Ok((out, pos));
            }
            _ => {
                return Err(PdfError::HexDecode { pos: pos - 1, bytes: [b, *buf.get(pos).unwrap_or(&0)] });
            }
        };
        match nibble.take() {
            Some(high) => out.push(high << 4 | digit),
            None => nibble = Some(digit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes() {
        let (s, n) = scan_literal_string(b"a\\nb\\rc\\td\\(f/)\\\\hei)").unwrap();
        assert_eq!(s, b"a\nb\rc\td(f/");
        assert_eq!(n, 15);
    }

    #[test]
    fn balanced_parens() {
        let (s, _) = scan_literal_string(b"a(b)c)").unwrap();
        assert_eq!(s, b"a(b)c");
    }

    #[test]
    fn line_continuations() {
        for data in [&b"These \\\ntwo strings \\\nare the same.)"[..], b"These \\\rtwo strings \\\rare the same.)", b"These \\\r\ntwo strings \\\r\nare the same.)"] {
            let (s, _) = scan_literal_string(data).unwrap();
            assert_eq!(s, b"These two strings are the same.");
        }
    }

    #[test]
    fn octal_escapes() {
        let (s, _) = scan_literal_string(b"with\\245two octals\\307.)").unwrap();
        assert_eq!(s, &b"with\xa5two octals\xc7."[..]);
        let (s, _) = scan_literal_string(b"\\0053)").unwrap();
        assert_eq!(s, b"\x053");
        let (s, _) = scan_literal_string(b"\\53)").unwrap();
        assert_eq!(s, b"+");
        // overflow truncates
        let (s, _) = scan_literal_string(b"\\541)").unwrap();
        assert_eq!(s, b"a");
    }

    #[test]
    fn unterminated() {
        assert!(scan_literal_string(b"no closing paren").is_err());
    }

    #[test]
    fn hex() {
        let (s, _) = scan_hex_string(b"901FA3>").unwrap();
        assert_eq!(s, [0x90, 0x1f, 0xa3]);
        // odd count: trailing nibble is the high half
        let (s, _) = scan_hex_string(b"901FA>").unwrap();
        assert_eq!(s, [0x90, 0x1f, 0xa0]);
        let (s, _) = scan_hex_string(b"1 9F\t5\r\n4\x0c62a>").unwrap();
        assert_eq!(s, [0x19, 0xf5, 0x46, 0x2a]);
        assert!(scan_hex_string(b"9x>").is_err());
    }
}
