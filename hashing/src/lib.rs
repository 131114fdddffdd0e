//! Content fingerprinting primitives shared by every crate that needs to answer
//! "did this file change": the persistent store, the autodep record layer, and
//! the job-exec supervisor's digest computation.

use std::fmt;
use std::io::{self, Write};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use digest::consts::U32;
use generic_array::GenericArray;
use serde::de::{MapAccess, Visitor};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer};
use sha2::{Digest as Sha256Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

pub const FINGERPRINT_SIZE: usize = 32;

pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

/// A 256-bit content hash. Orderable so it can be used as a key in the
/// persistent store's typed tables without an auxiliary index.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        assert_eq!(
            bytes.len(),
            FINGERPRINT_SIZE,
            "input was not a fingerprint; had length {}",
            bytes.len()
        );
        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.clone_from_slice(&bytes[0..FINGERPRINT_SIZE]);
        Fingerprint(fingerprint)
    }

    pub fn from_digest_bytes(bytes: GenericArray<u8, U32>) -> Fingerprint {
        Fingerprint(bytes.into())
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(FINGERPRINT_SIZE * 2);
        for byte in self.0 {
            fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }

    /// A cheap, non-cryptographic prefix used to shard the persistent store's
    /// typed tables (see `record_store`'s sharding scheme).
    pub fn prefix_hash(&self) -> u64 {
        u64::from_be_bytes(self.0[0..8].try_into().unwrap())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FingerprintVisitor;

        impl Visitor<'_> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a hex-encoded fingerprint")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &format!("{err}").as_str(),
                    )
                })
            }
        }

        deserializer.deserialize_str(FingerprintVisitor)
    }
}

/// A fingerprint plus the plaintext length it was computed over — equivalent
/// to a Bazel remote-execution Digest, without the protobuf overhead.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        Digest::new(Fingerprint::from_digest_bytes(hasher.finalize()), bytes.len())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut obj = serializer.serialize_struct("digest", 2)?;
        obj.serialize_field("fingerprint", &self.hash)?;
        obj.serialize_field("size_bytes", &self.size_bytes)?;
        obj.end()
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum DigestField {
    Fingerprint,
    SizeBytes,
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DigestVisitor;

        impl<'de> Visitor<'de> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct digest")
            }

            fn visit_map<V: MapAccess<'de>>(self, mut map: V) -> Result<Digest, V::Error> {
                use serde::de::Error;
                let mut fingerprint = None;
                let mut size_bytes = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        DigestField::Fingerprint => fingerprint = Some(map.next_value()?),
                        DigestField::SizeBytes => size_bytes = Some(map.next_value()?),
                    }
                }
                let fingerprint = fingerprint.ok_or_else(|| Error::missing_field("fingerprint"))?;
                let size_bytes = size_bytes.ok_or_else(|| Error::missing_field("size_bytes"))?;
                Ok(Digest::new(fingerprint, size_bytes))
            }
        }

        const FIELDS: &[&str] = &["fingerprint", "size_bytes"];
        deserializer.deserialize_struct("digest", FIELDS, DigestVisitor)
    }
}

/// A fingerprint alongside the instant it was last confirmed against disk —
/// used by the aging/lease machinery in the content-addressed store.
#[derive(Clone, Copy, Debug)]
pub struct AgedFingerprint {
    pub fingerprint: Fingerprint,
    pub size_bytes: usize,
    pub last_accessed_seconds: u64,
}

/// A `Write` wrapper that fingerprints all bytes passed through it.
pub struct WriterHasher<T> {
    hasher: Sha256,
    byte_count: usize,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher: Sha256::default(),
            byte_count: 0,
            inner,
        }
    }

    pub fn finish(self) -> (Digest, T) {
        (
            Digest::new(Fingerprint::from_digest_bytes(self.hasher.finalize()), self.byte_count),
            self.inner,
        )
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[0..written]);
        self.byte_count += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<AW: ?Sized + AsyncWrite + Unpin> AsyncWrite for WriterHasher<&mut AW> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let inner = Pin::new(&mut *self.inner);
        let result = inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = result {
            self.hasher.update(&buf[0..written]);
            self.byte_count += written;
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Copies `reader` into `writer`, fingerprinting the bytes in the same pass.
pub fn sync_copy_and_hash<R: io::Read + ?Sized, W: io::Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Digest> {
    let mut hasher = WriterHasher::new(writer);
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finish().0)
}

pub async fn async_copy_and_hash<R, W>(reader: &mut R, writer: &mut W) -> io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = WriterHasher::new(writer);
    tokio::io::copy(reader, &mut hasher).await?;
    Ok(hasher.finish().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_matches_sha256_of_empty_input() {
        assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
    }

    #[test]
    fn hex_round_trips() {
        let fp = Digest::of_bytes(b"hello world").hash;
        let hex = fp.to_hex();
        assert_eq!(Fingerprint::from_hex_string(&hex).unwrap(), fp);
    }

    #[test]
    fn rejects_wrong_length_hex() {
        assert!(Fingerprint::from_hex_string("abcd").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let digest = Digest::of_bytes(b"some content");
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }
}
