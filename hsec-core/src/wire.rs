//! Framing: separator-delimited fields + 4-byte big-endian length envelope.

/// Field separator. Not escaped; see `join_fields` for trailing binary payloads.
pub const SEPARATOR: u8 = 0x00;

/// Length header size in bytes.
pub const LEN_SIZE: usize = 4;

/// Join parts with the separator. No leading or trailing separator.
pub fn encode_fields<P: AsRef<[u8]>>(parts: &[P]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.as_ref().len()).sum::<usize>() + parts.len();
    let mut out = Vec::with_capacity(total);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.extend_from_slice(part.as_ref());
    }
    out
}

/// Split on the separator. A trailing empty field is kept only when the last byte is the separator.
/// An empty buffer yields a single empty field; callers check the field count before indexing.
pub fn decode_fields(buf: &[u8]) -> Vec<Vec<u8>> {
    buf.split(|b| *b == SEPARATOR).map(<[u8]>::to_vec).collect()
}

/// Re-join `fields[start..]` with the separator, restoring a trailing payload that contained separator bytes.
pub fn join_fields(fields: &[Vec<u8>], start: usize) -> Vec<u8> {
    match fields.get(start..) {
        Some(rest) => encode_fields(rest),
        None => Vec::new(),
    }
}

/// Decode and require at least `min` fields.
pub fn decode_at_least(buf: &[u8], min: usize) -> Result<Vec<Vec<u8>>, FieldDecodeError> {
    if buf.is_empty() {
        return Err(FieldDecodeError::Empty);
    }
    let fields = decode_fields(buf);
    if fields.len() < min {
        return Err(FieldDecodeError::TooFewFields {
            expected: min,
            got: fields.len(),
        });
    }
    Ok(fields)
}

/// Prefix `payload` with its length (4 bytes BE).
pub fn encode_envelope(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read the length header from the front of `bytes`.
pub fn decode_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    match bytes.get(..LEN_SIZE) {
        Some(h) => Ok(u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as usize),
        None => Err(FrameDecodeError::NeedMore),
    }
}

/// Decode one envelope from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Returns `NeedMore` on a partial buffer; the caller tries again after more data.
pub fn decode_envelope(bytes: &[u8], max_len: usize) -> Result<(&[u8], usize), FrameDecodeError> {
    let len = decode_len(bytes)?;
    if len > max_len {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FieldDecodeError {
    #[error("empty message")]
    Empty,
    #[error("expected at least {expected} fields, got {got}")]
    TooFewFields { expected: usize, got: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding an envelope (need more bytes, or over the size limit).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}
