//! Minimal synchronous netlink codec for the families the high-level
//! rtnetlink handle does not cover: the RDMA nldev protocol and raw traffic
//! control dumps. Messages are packed by hand; replies are returned as raw
//! payloads with a small TLV walker on top.

use std::io;

use bytes::BufMut;
use netlink_sys::Socket;

pub const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
/// NLM_F_ROOT | NLM_F_MATCH
pub const NLM_F_DUMP: u16 = 0x300;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Appends one netlink attribute (TLV with 4-byte padding) to `buf`.
pub fn put_attr(buf: &mut Vec<u8>, kind: u16, data: &[u8]) {
    let len = 4 + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(buf.len() + (align4(data.len()) - data.len()), 0);
}

pub fn put_attr_u32(buf: &mut Vec<u8>, kind: u16, value: u32) {
    put_attr(buf, kind, &value.to_ne_bytes());
}

pub fn put_attr_string(buf: &mut Vec<u8>, kind: u16, value: &str) {
    let mut data = value.as_bytes().to_vec();
    data.push(0);
    put_attr(buf, kind, &data);
}

/// Walks the attributes in `payload`, yielding `(kind, value)` pairs. The
/// nested flag bit is masked off the kind.
pub fn attrs(payload: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset + 4 > payload.len() {
            return None;
        }
        let len = u16::from_ne_bytes([payload[offset], payload[offset + 1]]) as usize;
        let kind = u16::from_ne_bytes([payload[offset + 2], payload[offset + 3]]) & 0x3fff;
        if len < 4 || offset + len > payload.len() {
            return None;
        }
        let value = &payload[offset + 4..offset + len];
        offset += align4(len);
        Some((kind, value))
    })
}

pub fn attr_u32(value: &[u8]) -> Option<u32> {
    value.get(..4).map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn attr_string(value: &[u8]) -> Option<String> {
    let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
    std::str::from_utf8(&value[..end]).ok().map(str::to_string)
}

/// One blocking netlink conversation. The socket lives in whatever network
/// namespace the calling thread is in when `open` runs, which is exactly the
/// property the namespace effector relies on.
pub struct RawConnection {
    socket: Socket,
    sequence: u32,
}

impl RawConnection {
    pub fn open(protocol: isize) -> io::Result<RawConnection> {
        let mut socket = Socket::new(protocol)?;
        socket.bind_auto()?;
        Ok(RawConnection {
            socket,
            sequence: 0,
        })
    }

    /// Sends one request and collects the payloads (header stripped) of all
    /// reply messages. A `NLMSG_ERROR` reply with a non-zero code maps to an
    /// `io::Error` of that errno; an ACK terminates with the payloads seen so
    /// far.
    pub fn request(
        &mut self,
        message_type: u16,
        flags: u16,
        payload: &[u8],
    ) -> io::Result<Vec<Vec<u8>>> {
        self.sequence += 1;
        let total = NLMSG_HDRLEN + payload.len();
        let mut packet = Vec::with_capacity(total);
        packet.extend_from_slice(&(total as u32).to_ne_bytes());
        packet.extend_from_slice(&message_type.to_ne_bytes());
        packet.extend_from_slice(&(flags | NLM_F_REQUEST).to_ne_bytes());
        packet.extend_from_slice(&self.sequence.to_ne_bytes());
        packet.extend_from_slice(&0u32.to_ne_bytes());
        packet.extend_from_slice(payload);

        self.socket.send(&packet, 0)?;

        let mut replies = Vec::new();
        let mut buf = Vec::with_capacity(64 * 1024);
        loop {
            buf.clear();
            let read = {
                let mut writer = (&mut buf).limit(64 * 1024);
                self.socket.recv(&mut writer, 0)?
            };
            let mut offset = 0usize;
            while offset + NLMSG_HDRLEN <= read {
                let msg = &buf[offset..];
                let len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
                if len < NLMSG_HDRLEN || offset + len > read {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "truncated netlink message",
                    ));
                }
                let kind = u16::from_ne_bytes([msg[4], msg[5]]);
                let msg_flags = u16::from_ne_bytes([msg[6], msg[7]]);
                match kind {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        if len < NLMSG_HDRLEN + 4 {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "truncated netlink error message",
                            ));
                        }
                        let code = i32::from_ne_bytes([msg[16], msg[17], msg[18], msg[19]]);
                        if code == 0 {
                            return Ok(replies);
                        }
                        return Err(io::Error::from_raw_os_error(-code));
                    }
                    _ => {
                        replies.push(msg[NLMSG_HDRLEN..len].to_vec());
                        if msg_flags & NLM_F_MULTI == 0 {
                            return Ok(replies);
                        }
                    }
                }
                offset += align4(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_round_trip() {
        let mut buf = Vec::new();
        put_attr_u32(&mut buf, 1, 42);
        put_attr_string(&mut buf, 2, "mlx5_0");
        put_attr(&mut buf, 3, &[0xde, 0xad]);

        let parsed: Vec<(u16, Vec<u8>)> =
            attrs(&buf).map(|(k, v)| (k, v.to_vec())).collect();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].0, 1);
        assert_eq!(attr_u32(&parsed[0].1), Some(42));
        assert_eq!(parsed[1].0, 2);
        assert_eq!(attr_string(&parsed[1].1).as_deref(), Some("mlx5_0"));
        assert_eq!(parsed[2].1, vec![0xde, 0xad]);
    }

    #[test]
    fn attribute_padding_is_four_bytes() {
        let mut buf = Vec::new();
        put_attr(&mut buf, 7, &[1]);
        // 4 bytes header + 1 byte value padded to 4.
        assert_eq!(buf.len(), 8);
        let (kind, value) = attrs(&buf).next().unwrap();
        assert_eq!(kind, 7);
        assert_eq!(value, &[1]);
    }

    #[test]
    fn walker_stops_on_truncated_input() {
        let mut buf = Vec::new();
        put_attr_u32(&mut buf, 1, 1);
        buf.truncate(buf.len() - 2);
        assert_eq!(attrs(&buf).count(), 0);
    }
}
