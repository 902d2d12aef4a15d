//! `[0xF0|vlen][varint len][payload]` record framing over a `MappedWindow`.

use crate::mmap::MappedWindow;
use crate::varint;
use crate::{Error, Result};

/// Magic nibble marking the start of a frame; also used by recovery scans
/// to detect the boundary between written data and zeroed/partial tail
/// bytes.
pub const MAGIC: u8 = 0xF0;

/// One framed record delivered by `scan_next`. `id` is the logical offset
/// of the frame's header byte, not the payload — callers save this as
/// their next `pull` cursor. `payload` borrows from the window and is only
/// valid until the next call that advances or remaps it.
pub struct Frame<'a> {
    pub id: u64,
    pub payload: &'a [u8],
}

fn write_header(window: &mut MappedWindow, payload_len: usize) -> Result<()> {
    let encoded = varint::encode(payload_len as u64);
    let vlen = encoded.len();
    if vlen > 0x0F {
        return Err(Error::InvalidArgument("payload length needs more than 15 varint bytes"));
    }
    let mut buf = [0u8; 1 + varint::MAX_ENCODED_LEN];
    buf[0] = MAGIC | vlen;
    buf[1..1 + vlen as usize].copy_from_slice(encoded.as_slice());
    window.write(&buf[..1 + vlen as usize])?;
    Ok(())
}

/// Writes one frame: header, varint length, payload. Returns the writer's
/// new `last_position`.
pub fn put(window: &mut MappedWindow, payload: &[u8]) -> Result<u64> {
    write_header(window, payload.len())?;
    window.write(payload)?;
    Ok(window.last_position())
}

/// Writes one frame whose payload is the concatenation of `buffers` — a
/// single framed record the reader cannot tell apart from a flat payload
/// of the same total length.
pub fn put_vectored(window: &mut MappedWindow, buffers: &[&[u8]]) -> Result<u64> {
    let total: usize = buffers.iter().map(|b| b.len()).sum();
    write_header(window, total)?;
    for buf in buffers {
        window.write(buf)?;
    }
    Ok(window.last_position())
}

/// Scans one frame starting at the reader's current cursor, honoring the
/// sliding window: peeks the header, re-seeks at the frame start if the
/// window doesn't currently hold enough bytes, and stops (returns `None`)
/// on a non-frame byte or on data that is still unavailable after the
/// re-seek. Leaves the cursor at the start of the next frame on success.
fn try_reseek(window: &mut MappedWindow, record_start: u64) -> Result<bool> {
    match window.seek(record_start) {
        Ok(()) => Ok(true),
        Err(Error::Exhausted) => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn scan_next<'a>(window: &'a mut MappedWindow) -> Result<Option<Frame<'a>>> {
    let record_start = window.last_position();

    if window.remaining() < 1 {
        if !try_reseek(window, record_start)? || window.remaining() < 1 {
            return Ok(None);
        }
    }
    let header_byte = {
        let (ptr, _) = window.get_ptr()?;
        unsafe { *ptr }
    };
    if header_byte & 0xF0 != MAGIC {
        return Ok(None);
    }
    let vlen = (header_byte & 0x0F) as usize;
    // vlen is a 4-bit nibble (0..=15) but a u64 varint never encodes past
    // MAX_ENCODED_LEN bytes (§9: vlen == 11..15 is reserved). A reserved
    // value can only come from a non-frame byte or a corrupt/torn tail;
    // stop the scan rather than feed an out-of-range slice to the codec.
    if vlen > varint::MAX_ENCODED_LEN {
        return Ok(None);
    }

    if window.remaining() < 1 + vlen {
        if !try_reseek(window, record_start)? || window.remaining() < 1 + vlen {
            return Ok(None);
        }
    }
    // The varint is decoded from exactly the `vlen` bytes the header
    // declared for it, never spilling into payload territory. A torn or
    // corrupt tail (continuation bit never cleared within those bytes) is
    // an unreadable frame, not an error: stop the scan, same as hitting a
    // non-magic byte.
    let len = {
        let (ptr, _) = window.get_ptr()?;
        let slice = unsafe { std::slice::from_raw_parts(ptr.add(1), vlen) };
        match varint::decode(slice) {
            Ok((value, consumed)) if consumed == vlen => value,
            _ => return Ok(None),
        }
    };
    let payload_len = len as usize;

    let record_len = 1 + vlen + payload_len;
    if window.remaining() < record_len {
        if !try_reseek(window, record_start)? || window.remaining() < record_len {
            return Ok(None);
        }
    }

    let payload_ptr = {
        let (ptr, _) = window.get_ptr()?;
        unsafe { ptr.add(1 + vlen) }
    };
    let payload = unsafe { std::slice::from_raw_parts(payload_ptr, payload_len) };
    window.advance(record_len)?;

    Ok(Some(Frame {
        id: record_start,
        payload,
    }))
}
