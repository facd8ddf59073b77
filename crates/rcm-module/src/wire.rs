//! Soft fabric wire format.
//!
//! ```text
//! +-----+----------------+-----------------+
//! | tag | len (u32, BE)  | payload (len B) |
//! +-----+----------------+-----------------+
//! ```
//!
//! Handshake: the active side connects, the passive side answers `ACCEPT`
//! once its receive is posted, the active side confirms with `READY`.
//! Every send work request becomes one `DATA` frame.

use std::io::{self, Read, Write};

pub mod tag {
    pub const ACCEPT: u8 = 1;
    pub const READY: u8 = 2;
    pub const DATA: u8 = 3;
    pub const DISCONNECT: u8 = 4;
}

/// Largest payload accepted from the network.
pub const MAX_FRAME_LEN: usize = 16 << 20;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Accept,
    Ready,
    Data(Vec<u8>),
    Disconnect,
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Accept => tag::ACCEPT,
            Frame::Ready => tag::READY,
            Frame::Data(_) => tag::DATA,
            Frame::Disconnect => tag::DISCONNECT,
        }
    }
}

/// Write one frame. The header and payload go out in a single write.
pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> io::Result<()> {
    let payload: &[u8] = match frame {
        Frame::Data(bytes) => bytes,
        _ => &[],
    };
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(frame.tag());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf)?;
    w.flush()
}

/// Read one frame. `Ok(None)` on a clean EOF between frames.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match r.read(&mut header[..1])? {
        0 => return Ok(None),
        _ => r.read_exact(&mut header[1..])?,
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds {}", len, MAX_FRAME_LEN),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;

    let frame = match header[0] {
        tag::ACCEPT => Frame::Accept,
        tag::READY => Frame::Ready,
        tag::DATA => Frame::Data(payload),
        tag::DISCONNECT => Frame::Disconnect,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame tag {}", other),
            ))
        }
    };
    Ok(Some(frame))
}
