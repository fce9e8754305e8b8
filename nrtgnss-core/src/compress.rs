//! Transfer compression: gzip (`.gz`) and Unix compress (`.Z`).
//!
//! Providers publish the same RINEX file under either suffix. Both are
//! unpacked to plain files before an artifact is moved into place.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// Compression of a remote file, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Compress,
}

impl Compression {
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            Compression::Gzip
        } else if name.ends_with(".Z") {
            Compression::Compress
        } else {
            Compression::None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Compress => "compress",
        }
    }
}

/// Unpack `src` into `dst`, returning the unpacked size.
pub fn unpack(compression: Compression, src: &Path, dst: &Path) -> io::Result<u64> {
    match compression {
        Compression::None => fs::copy(src, dst),
        Compression::Gzip => gunzip(src, dst),
        Compression::Compress => {
            let mut input = Vec::new();
            File::open(src)?.read_to_end(&mut input)?;
            let mut out = BufWriter::new(File::create(dst)?);
            let n = uncompress(&input, &mut out)?;
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(n)
        }
    }
}

pub fn gunzip(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(File::open(src)?);
    let mut out = File::create(dst)?;
    let n = io::copy(&mut decoder, &mut out)?;
    out.sync_all()?;
    Ok(n)
}

// ── Unix compress (LZW) ──────────────────────────────────────────────

const MAGIC: [u8; 2] = [0x1f, 0x9d];
const BLOCK_MODE: u8 = 0x80;
const INIT_BITS: u32 = 9;
const CLEAR: usize = 256;

fn corrupt(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!(".Z stream: {reason}"))
}

/// LSB-first reader over the code section of a `.Z` stream.
struct Codes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Codes<'_> {
    fn next(&mut self, bits: u32) -> Option<usize> {
        let end = self.pos + bits as usize;
        if end > self.data.len() * 8 {
            return None;
        }
        let mut code = 0usize;
        for i in 0..bits as usize {
            let bit = self.pos + i;
            if self.data[bit / 8] & (1 << (bit % 8)) != 0 {
                code |= 1 << i;
            }
        }
        self.pos = end;
        Some(code)
    }

    /// compress writes codes in groups of eight; a width change or a
    /// table clear discards the rest of the current group.
    fn skip_group(&mut self, read: usize, bits: u32) {
        if read % 8 != 0 {
            self.pos += (8 - read % 8) * bits as usize;
        }
    }
}

/// Decode a complete `.Z` stream into `out`.
pub fn uncompress(input: &[u8], out: &mut impl Write) -> io::Result<u64> {
    if input.len() < 3 || input[..2] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let max_bits = u32::from(input[2] & 0x1f);
    let block_mode = input[2] & BLOCK_MODE != 0;
    if !(INIT_BITS..=16).contains(&max_bits) {
        return Err(corrupt("unsupported code width"));
    }

    let table_size = 1usize << max_bits;
    let mut prefix = vec![0usize; table_size];
    let mut suffix: Vec<u8> = (0..table_size).map(|c| c as u8).collect();
    let mut stack = Vec::new();

    let mut codes = Codes { data: &input[3..], pos: 0 };
    let mut bits = INIT_BITS;
    let mut max_code = (1usize << bits) - 1;
    let mut free = if block_mode { CLEAR + 1 } else { CLEAR };
    let mut read = 0usize;
    let mut old: Option<usize> = None;
    let mut last_char = 0u8;
    let mut written = 0u64;

    loop {
        if free > max_code && bits < max_bits {
            codes.skip_group(read, bits);
            bits += 1;
            max_code = if bits == max_bits { table_size } else { (1 << bits) - 1 };
            read = 0;
        }
        let Some(code) = codes.next(bits) else {
            break;
        };
        read += 1;

        let Some(prev) = old else {
            if code >= CLEAR {
                return Err(corrupt("first code is not a literal"));
            }
            last_char = code as u8;
            out.write_all(&[last_char])?;
            written += 1;
            old = Some(code);
            continue;
        };

        if block_mode && code == CLEAR {
            codes.skip_group(read, bits);
            bits = INIT_BITS;
            max_code = (1 << bits) - 1;
            free = CLEAR;
            read = 0;
            continue;
        }

        stack.clear();
        let mut cur = code;
        if cur >= free {
            if cur > free {
                return Err(corrupt("code out of range"));
            }
            stack.push(last_char);
            cur = prev;
        }
        while cur >= CLEAR {
            if stack.len() >= table_size {
                return Err(corrupt("cyclic code table"));
            }
            stack.push(suffix[cur]);
            cur = prefix[cur];
        }
        last_char = suffix[cur];
        stack.push(last_char);
        stack.reverse();
        out.write_all(&stack)?;
        written += stack.len() as u64;

        if free < table_size {
            prefix[free] = prev;
            suffix[free] = last_char;
            free += 1;
        }
        old = Some(code);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    // "abab": codes 97, 98, 257 at nine bits.
    const ABAB_Z: [u8; 7] = [0x1f, 0x9d, 0x90, 0x61, 0xc4, 0x04, 0x04];

    fn decode(input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        uncompress(input, &mut out)?;
        Ok(out)
    }

    #[test]
    fn suffix_selects_compression() {
        assert_eq!(Compression::from_name("abmf260m.24d.Z"), Compression::Compress);
        assert_eq!(Compression::from_name("abmf260m.24o.gz"), Compression::Gzip);
        assert_eq!(Compression::from_name("abmf260m.24o"), Compression::None);
        assert_eq!(Compression::from_name("abmf260m.24o.z"), Compression::None);
    }

    #[test]
    fn decodes_dictionary_references() {
        assert_eq!(decode(&ABAB_Z).unwrap(), b"abab");
    }

    #[test]
    fn decodes_code_defined_by_itself() {
        // "aaa": 97 then 257, which is being defined by that very code.
        assert_eq!(decode(&[0x1f, 0x9d, 0x90, 0x61, 0x02, 0x02]).unwrap(), b"aaa");
    }

    #[test]
    fn rejects_bad_streams() {
        assert!(decode(b"plain text").is_err());
        assert!(decode(&[0x1f, 0x9d, 0x08]).is_err());
        // 300 is neither a literal nor a defined code.
        let bad = [0x1f, 0x9d, 0x90, 0x61, 0x58, 0x02];
        assert!(decode(&bad).is_err());
    }

    #[test]
    fn unpack_gzip_and_compress_files() {
        let dir = tempfile::tempdir().unwrap();
        let z = dir.path().join("a.Z");
        fs::write(&z, ABAB_Z).unwrap();
        let out = dir.path().join("a");
        assert_eq!(unpack(Compression::Compress, &z, &out).unwrap(), 4);
        assert_eq!(fs::read(&out).unwrap(), b"abab");

        let gz = dir.path().join("b.gz");
        let mut enc = flate2::write::GzEncoder::new(File::create(&gz).unwrap(), flate2::Compression::default());
        enc.write_all(b"rinex body").unwrap();
        enc.finish().unwrap();
        let out = dir.path().join("b");
        assert_eq!(unpack(Compression::Gzip, &gz, &out).unwrap(), 10);
        assert_eq!(fs::read(&out).unwrap(), b"rinex body");
    }
}
