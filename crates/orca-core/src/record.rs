//! Market record codec: the binary blob stored under `market/<fileHash>`.
//!
//! A blob is a run of self-describing frames followed by a freshness stamp:
//!
//! ```text
//! frame     = entryLen:u16-LE  sigLen:u16-LE  entryBytes  signatureBytes
//! blob      = frame*  timestamp:u64-BE   (Unix seconds)
//! ```
//!
//! The trailing 8 bytes are never part of a frame. Entry bytes are the
//! holder's own serialization (see [`HolderEntry::to_bytes`]) and the
//! signature covers exactly those bytes, so frames can be copied between
//! blobs without re-signing.
//!
//! Every read is bounds-checked. A length prefix that points past the end
//! of the body is a [`RecordError`], never a panic.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::crypto::{self, Identity};

/// Size of the trailing freshness timestamp.
pub const TIMESTAMP_LEN: usize = 8;

/// Size of the two length prefixes that open every frame.
pub const FRAME_HEADER_LEN: usize = 4;

// ── Holder entry ──────────────────────────────────────────────────────────────

/// One producer's advertisement for one file.
///
/// Identity is `public_key`; at most one entry per key survives in a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderEntry {
    pub public_key: Vec<u8>,
    pub ip: String,
    pub port: u16,
    pub price: u64,
}

impl HolderEntry {
    /// Serialize as `pkLen:u16 pk ipLen:u16 ip port:u16 price:u64`, all little-endian.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let pk_len = u16::try_from(self.public_key.len())
            .map_err(|_| RecordError::FieldTooLong(self.public_key.len()))?;
        let ip_len =
            u16::try_from(self.ip.len()).map_err(|_| RecordError::FieldTooLong(self.ip.len()))?;

        let mut out = Vec::with_capacity(2 + self.public_key.len() + 2 + self.ip.len() + 10);
        out.put_u16_le(pk_len);
        out.put_slice(&self.public_key);
        out.put_u16_le(ip_len);
        out.put_slice(self.ip.as_bytes());
        out.put_u16_le(self.port);
        out.put_u64_le(self.price);
        Ok(out)
    }

    /// Parse entry bytes. Trailing bytes after `price` are ignored.
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self, RecordError> {
        let public_key = take_prefixed(&mut buf, "public key")?.to_vec();
        let ip = std::str::from_utf8(take_prefixed(&mut buf, "ip")?)
            .map_err(|_| RecordError::MalformedEntry("ip is not utf-8"))?
            .to_string();
        if buf.remaining() < 10 {
            return Err(RecordError::MalformedEntry("missing port/price"));
        }
        let port = buf.get_u16_le();
        let price = buf.get_u64_le();
        Ok(Self {
            public_key,
            ip,
            port,
            price,
        })
    }

    /// Hex form of the public key, used as the holder's peer id.
    pub fn peer_id(&self) -> String {
        hex::encode(&self.public_key)
    }
}

fn take_prefixed<'a>(buf: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], RecordError> {
    if buf.remaining() < 2 {
        return Err(RecordError::MalformedEntry(what));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(RecordError::MalformedEntry(what));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

// ── Signed entry ──────────────────────────────────────────────────────────────

/// A decoded frame: the parsed entry plus the exact bytes that were signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEntry {
    pub entry: HolderEntry,
    pub entry_bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedEntry {
    /// Serialize `entry` and sign it with `signer`.
    pub fn sign(entry: HolderEntry, signer: &Identity) -> Result<Self, RecordError> {
        let entry_bytes = entry.to_bytes()?;
        let signature = signer.sign(&entry_bytes).to_vec();
        Ok(Self {
            entry,
            entry_bytes,
            signature,
        })
    }

    /// Check the signature against the embedded public key.
    pub fn verify(&self) -> bool {
        crypto::verify(&self.entry_bytes, &self.signature, &self.entry.public_key)
    }

    fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.entry_bytes.len() + self.signature.len()
    }

    fn write_frame(&self, out: &mut Vec<u8>) -> Result<(), RecordError> {
        let entry_len = u16::try_from(self.entry_bytes.len())
            .map_err(|_| RecordError::FieldTooLong(self.entry_bytes.len()))?;
        let sig_len = u16::try_from(self.signature.len())
            .map_err(|_| RecordError::FieldTooLong(self.signature.len()))?;
        out.put_u16_le(entry_len);
        out.put_u16_le(sig_len);
        out.put_slice(&self.entry_bytes);
        out.put_slice(&self.signature);
        Ok(())
    }
}

/// A fully decoded blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub entries: Vec<SignedEntry>,
    pub timestamp: u64,
}

// ── Encode / decode / replace ─────────────────────────────────────────────────

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sign every entry with `signer` and frame them, stamped with the current time.
pub fn encode(entries: &[HolderEntry], signer: &Identity) -> Result<Vec<u8>, RecordError> {
    let signed = entries
        .iter()
        .cloned()
        .map(|e| SignedEntry::sign(e, signer))
        .collect::<Result<Vec<_>, _>>()?;
    encode_signed(&signed, unix_now())
}

/// Frame already-signed entries and append `timestamp`.
pub fn encode_signed(entries: &[SignedEntry], timestamp: u64) -> Result<Vec<u8>, RecordError> {
    let body: usize = entries.iter().map(SignedEntry::frame_len).sum();
    let mut out = Vec::with_capacity(body + TIMESTAMP_LEN);
    for entry in entries {
        entry.write_frame(&mut out)?;
    }
    out.put_u64(timestamp);
    Ok(out)
}

/// Walk the frames of `blob` and read its trailing timestamp.
pub fn decode(blob: &[u8]) -> Result<DecodedRecord, RecordError> {
    if blob.len() < TIMESTAMP_LEN {
        return Err(RecordError::TooShort(blob.len()));
    }
    let (mut body, mut stamp) = blob.split_at(blob.len() - TIMESTAMP_LEN);
    let body_len = body.len();

    let mut entries = Vec::new();
    while body.has_remaining() {
        let offset = body_len - body.remaining();
        if body.remaining() < FRAME_HEADER_LEN {
            return Err(RecordError::FrameOverrun { offset });
        }
        let entry_len = body.get_u16_le() as usize;
        let sig_len = body.get_u16_le() as usize;
        if body.remaining() < entry_len + sig_len {
            return Err(RecordError::FrameOverrun { offset });
        }
        let (entry_bytes, rest) = body.split_at(entry_len);
        let (signature, rest) = rest.split_at(sig_len);
        body = rest;

        entries.push(SignedEntry {
            entry: HolderEntry::from_bytes(entry_bytes)?,
            entry_bytes: entry_bytes.to_vec(),
            signature: signature.to_vec(),
        });
    }

    Ok(DecodedRecord {
        entries,
        timestamp: stamp.get_u64(),
    })
}

/// Read only the trailing timestamp. `None` if the blob is too short.
pub fn timestamp_of(blob: &[u8]) -> Option<u64> {
    let tail = blob.get(blob.len().checked_sub(TIMESTAMP_LEN)?..)?;
    Some(u64::from_be_bytes(tail.try_into().ok()?))
}

/// Merge `new_entry` into `blob`, dropping any earlier frame for the same key.
///
/// An empty `blob` means no record exists yet. Other frames are copied
/// byte-for-byte; only the new frame is signed.
pub fn replace(blob: &[u8], new_entry: HolderEntry, signer: &Identity) -> Result<Vec<u8>, RecordError> {
    replace_at(blob, new_entry, signer, unix_now())
}

/// [`replace`] with an explicit timestamp.
pub fn replace_at(
    blob: &[u8],
    new_entry: HolderEntry,
    signer: &Identity,
    timestamp: u64,
) -> Result<Vec<u8>, RecordError> {
    let mut entries = if blob.is_empty() {
        Vec::new()
    } else {
        decode(blob)?.entries
    };

    if let Some(pos) = entries
        .iter()
        .position(|e| e.entry.public_key == new_entry.public_key)
    {
        entries.remove(pos);
    }
    entries.push(SignedEntry::sign(new_entry, signer)?);

    encode_signed(&entries, timestamp)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is {0} bytes, shorter than the trailing timestamp")]
    TooShort(usize),

    #[error("frame at offset {offset} runs past the record body")]
    FrameOverrun { offset: usize },

    #[error("malformed holder entry: {0}")]
    MalformedEntry(&'static str),

    #[error("field of {0} bytes does not fit a u16 length prefix")]
    FieldTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
