//! Type-length-value option lists shared by the IPv4 and TCP headers.
//!
//! Both headers use the same encoding: kind `0` ends the list, kind `1` is a one-byte no-op, every
//! other kind is followed by a length byte covering kind + length + data. The list is zero-padded
//! to a 32-bit boundary on the wire.

use super::PacketError;

pub const OPT_END: u8 = 0;
pub const OPT_NOP: u8 = 1;

/// Upper bound of the option area of both headers (15 words minus the 5-word fixed part).
pub const MAX_OPTIONS_LEN: usize = 40;

/// Splits an option area into `(kind, data)` pairs.
///
/// Parsing stops at an end-of-options marker or when the area is exhausted. A single-byte no-op
/// yields `(OPT_NOP, &[])`.
pub(crate) fn parse_raw(mut area: &[u8]) -> Result<Vec<(u8, &[u8])>, PacketError> {
    let mut out = Vec::new();
    while let Some(&kind) = area.first() {
        match kind {
            OPT_END => break,
            OPT_NOP => {
                out.push((OPT_NOP, &area[..0]));
                area = &area[1..];
            }
            _ => {
                if area.len() < 2 {
                    return Err(PacketError::Malformed("option missing length byte"));
                }
                let len = area[1] as usize;
                if len < 2 || len > area.len() {
                    return Err(PacketError::Malformed("option length out of range"));
                }
                out.push((kind, &area[2..len]));
                area = &area[len..];
            }
        }
    }
    Ok(out)
}

pub(crate) fn encoded_len(kind: u8, data: &[u8]) -> usize {
    match kind {
        OPT_END | OPT_NOP => 1,
        _ => 2 + data.len(),
    }
}

/// Rounds an unpadded option length up to whole 32-bit words.
pub(crate) fn padded_len(unpadded: usize) -> usize {
    (unpadded + 3) & !3
}

/// Writes `(kind, data)` pairs into `out`, zero-filling the remainder (end-of-options padding).
///
/// `out` must be exactly the padded option area.
pub(crate) fn write_raw<'a, I>(items: I, out: &mut [u8]) -> Result<(), PacketError>
where
    I: IntoIterator<Item = (u8, &'a [u8])>,
{
    let mut pos = 0usize;
    for (kind, data) in items {
        match kind {
            OPT_END | OPT_NOP => {
                *out.get_mut(pos).ok_or(PacketError::Malformed("options overflow header"))? = kind;
                pos += 1;
            }
            _ => {
                let len = 2 + data.len();
                if len > u8::MAX as usize {
                    return Err(PacketError::Malformed("option data too long"));
                }
                let dst = out
                    .get_mut(pos..pos + len)
                    .ok_or(PacketError::Malformed("options overflow header"))?;
                dst[0] = kind;
                dst[1] = len as u8;
                dst[2..].copy_from_slice(data);
                pos += len;
            }
        }
    }
    out[pos..].fill(0);
    Ok(())
}
