//! RCON packet framing.
//!
//! Each packet is `length:i32le | id:i32le | type:i32le | body | 0x00 0x00`,
//! where `length` counts everything after itself.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Client login request
pub const TYPE_AUTH: i32 = 3;
/// Server reply to a login request (shares its value with `TYPE_COMMAND`)
pub const TYPE_AUTH_RESPONSE: i32 = 2;
/// Client command request
pub const TYPE_COMMAND: i32 = 2;
/// Server reply to a command
pub const TYPE_RESPONSE: i32 = 0;

/// Request id the server uses to reject a login
pub const AUTH_FAILED_ID: i32 = -1;

/// Largest accepted frame (servers split longer replies)
const MAX_FRAME: usize = 4096 + 10;
/// Largest command body Minecraft accepts from a client
pub const MAX_COMMAND_LEN: usize = 1446;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RconCodec;

impl Decoder for RconCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if length < 10 || length as usize > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid rcon frame length {}", length),
            ));
        }

        let length = length as usize;
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let id = src.get_i32_le();
        let kind = src.get_i32_le();
        let body_len = length - 10;
        let body = src.split_to(body_len);
        let terminator = src.split_to(2);
        if terminator[..] != [0, 0] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "rcon frame is not null terminated",
            ));
        }

        Ok(Some(Packet {
            id,
            kind,
            body: String::from_utf8_lossy(&body).into_owned(),
        }))
    }
}

impl Encoder<Packet> for RconCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = packet.body.as_bytes();
        if body.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rcon body must not contain NUL bytes",
            ));
        }
        if body.len() + 10 > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rcon body too large",
            ));
        }

        dst.reserve(14 + body.len());
        dst.put_i32_le((body.len() + 10) as i32);
        dst.put_i32_le(packet.id);
        dst.put_i32_le(packet.kind);
        dst.put_slice(body);
        dst.put_u8(0);
        dst.put_u8(0);
        Ok(())
    }
}
