// Copyright 2024 the openwrt-imagegen authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming I/O and hashing helpers shared by the cache, artifact, and
//! flash layers.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

use openssl::sha::Sha256;

// The default BufReader/BufWriter buffer size is 8 KiB, which isn't large
// enough to fully amortize system call overhead.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Chunk size used for streaming SHA-256 computation.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Like `std::io::copy()`, but limits the number of bytes copied over.  The
/// `Read` trait has `take()`, but that takes ownership of the reader.  We
/// also take a buf to avoid re-initializing a block each time.
pub fn copy_n(
    reader: &mut (impl Read + ?Sized),
    writer: &mut (impl Write + ?Sized),
    mut n: u64,
    buf: &mut [u8],
) -> io::Result<u64> {
    let mut written = 0;
    loop {
        if n == 0 {
            return Ok(written);
        }
        let bufn = if n < (buf.len() as u64) {
            &mut buf[..n as usize]
        } else {
            &mut *buf
        };
        let len = match reader.read(bufn) {
            Ok(0) => return Ok(written),
            Ok(len) => len,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&bufn[..len])?;
        written += len as u64;
        n -= len as u64;
    }
}

/// A `Write` sink that hashes everything written through it.
pub struct Sha256Writer<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Sha256Writer<W> {
    pub fn new(inner: W) -> Self {
        Sha256Writer {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning the inner sink, the hex digest, and
    /// the byte count.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finish()), self.written)
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash up to `max_bytes` from a reader (all of it when `None`), returning
/// the hex digest and the number of bytes actually hashed.
pub fn sha256_reader(
    reader: &mut (impl Read + ?Sized),
    max_bytes: Option<u64>,
) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    let mut hashed: u64 = 0;
    loop {
        let want = match max_bytes {
            Some(max) => {
                let remaining = max - hashed;
                if remaining == 0 {
                    break;
                }
                remaining.min(buf.len() as u64) as usize
            }
            None => buf.len(),
        };
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        hashed += n as u64;
    }
    Ok((hex::encode(hasher.finish()), hashed))
}

/// Hash a file (or its first `max_bytes` bytes).
pub fn sha256_file(path: &Path, max_bytes: Option<u64>) -> io::Result<(String, u64)> {
    let mut f = File::open(path)?;
    sha256_reader(&mut f, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    // SHA-256 of the empty string.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_copy_n() {
        let mut sink = std::io::sink();
        let mut buf = [0u8; 50];

        let data = [0u8; 30];
        assert_eq!(copy_n(&mut &data[..], &mut sink, 0, &mut buf).unwrap(), 0);
        assert_eq!(copy_n(&mut &data[..], &mut sink, 29, &mut buf).unwrap(), 29);
        assert_eq!(copy_n(&mut &data[..], &mut sink, 30, &mut buf).unwrap(), 30);
        assert_eq!(copy_n(&mut &data[..], &mut sink, 31, &mut buf).unwrap(), 30);
        assert_eq!(copy_n(&mut &data[..], &mut sink, 51, &mut buf).unwrap(), 30);
    }

    #[test]
    fn test_sha256_reader_empty() {
        let (digest, n) = sha256_reader(&mut &b""[..], None).unwrap();
        assert_eq!(digest, EMPTY_SHA256);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_sha256_reader_bounded() {
        let data = vec![0xabu8; 200 * 1024];
        let (full, n_full) = sha256_reader(&mut &data[..], None).unwrap();
        assert_eq!(n_full, data.len() as u64);
        let (prefix, n_prefix) = sha256_reader(&mut &data[..], Some(1024)).unwrap();
        assert_eq!(n_prefix, 1024);
        assert_ne!(full, prefix);
        let (prefix2, _) = sha256_reader(&mut &data[..1024], None).unwrap();
        assert_eq!(prefix, prefix2);
    }

    #[test]
    fn test_sha256_file_matches_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let data = b"hello imagegen".repeat(10_000);
        write(&path, &data).unwrap();
        let (from_file, n) = sha256_file(&path, None).unwrap();
        let (from_reader, _) = sha256_reader(&mut &data[..], None).unwrap();
        assert_eq!(from_file, from_reader);
        assert_eq!(n, data.len() as u64);
    }

    #[test]
    fn test_sha256_writer_tracks_stream() {
        let mut out = Vec::new();
        let mut w = Sha256Writer::new(&mut out);
        w.write_all(b"abc").unwrap();
        w.write_all(b"def").unwrap();
        let (_, digest, written) = w.finish();
        assert_eq!(written, 6);
        let (expected, _) = sha256_reader(&mut &b"abcdef"[..], None).unwrap();
        assert_eq!(digest, expected);
        assert_eq!(out, b"abcdef");
    }
}
