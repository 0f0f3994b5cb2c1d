//! On-wire framing for the networked KV simulator (`nvkv`), preserved
//! verbatim from the original C protocol (`nvme_kv_proto.h`) so the
//! existing simulator remains interoperable.
//!
//! Request header (24 bytes): magic, version, opcode, flags, reserved,
//! key-length, reserved, value-length, command-id, reserved. Followed by
//! the key bytes, then (for `STORE`) the value bytes.
//!
//! Response header (16 bytes): magic, status, reserved, value-length,
//! command-id. Followed by value bytes for `RETRIEVE` and `LIST`; a
//! `LIST` payload is a sequence of `(u16 key-len, key, u32 value-len,
//! value)` tuples.

use std::io::{self, Read, Write};

pub const MAGIC: u32 = 0x4E56_4B56; // matches NVME_KV_MAGIC's raw struct bytes on the wire
pub const PROTOCOL_VERSION: u8 = 1;
pub const DEFAULT_PORT: u16 = 9527;
pub const MAX_KEY_LEN: usize = 272;
pub const MAX_VALUE_LEN: usize = 2 * 1024 * 1024;

pub const REQUEST_HEADER_LEN: usize = 24;
pub const RESPONSE_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Store = 0x01,
    Retrieve = 0x02,
    List = 0x06,
    Delete = 0x10,
    Exist = 0x14,
}

impl Opcode {
    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0x01 => Ok(Self::Store),
            0x02 => Ok(Self::Retrieve),
            0x06 => Ok(Self::List),
            0x10 => Ok(Self::Delete),
            0x14 => Ok(Self::Exist),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown opcode {other:#x}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Success = 0,
    NotFound = 1,
    Exists = 2,
    InvalidKey = 3,
    InvalidValue = 4,
    Internal = 0xFF,
}

impl Status {
    fn from_u16(v: u16) -> io::Result<Self> {
        match v {
            0 => Ok(Self::Success),
            1 => Ok(Self::NotFound),
            2 => Ok(Self::Exists),
            3 => Ok(Self::InvalidKey),
            4 => Ok(Self::InvalidValue),
            0xFF => Ok(Self::Internal),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown status {other:#x}"),
            )),
        }
    }
}

pub struct Request {
    pub opcode: Opcode,
    pub flags: u8,
    pub command_id: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Request {
    pub fn new(opcode: Opcode, command_id: u32, key: Vec<u8>, value: Vec<u8>) -> io::Result<Self> {
        if key.len() > MAX_KEY_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "key too long"));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "value too long",
            ));
        }
        Ok(Self {
            opcode,
            flags: 0,
            command_id,
            key,
            value,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4] = PROTOCOL_VERSION;
        header[5] = self.opcode as u8;
        header[6] = self.flags;
        header[7] = 0; // reserved
        header[8..10].copy_from_slice(&(self.key.len() as u16).to_le_bytes());
        header[10..12].copy_from_slice(&0u16.to_le_bytes()); // reserved
        header[12..16].copy_from_slice(&(self.value.len() as u32).to_le_bytes());
        header[16..20].copy_from_slice(&self.command_id.to_le_bytes());
        header[20..24].copy_from_slice(&0u32.to_le_bytes()); // reserved
        w.write_all(&header)?;
        w.write_all(&self.key)?;
        if matches!(self.opcode, Opcode::Store) {
            w.write_all(&self.value)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        r.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        let opcode = Opcode::from_u8(header[5])?;
        let flags = header[6];
        let key_len = u16::from_le_bytes(header[8..10].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        let command_id = u32::from_le_bytes(header[16..20].try_into().unwrap());
        if key_len > MAX_KEY_LEN || value_len > MAX_VALUE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "key/value length exceeds protocol maximum",
            ));
        }
        let mut key = vec![0u8; key_len];
        r.read_exact(&mut key)?;
        let mut value = Vec::new();
        if matches!(opcode, Opcode::Store) {
            value = vec![0u8; value_len];
            r.read_exact(&mut value)?;
        }
        Ok(Self {
            opcode,
            flags,
            command_id,
            key,
            value,
        })
    }
}

pub struct Response {
    pub status: Status,
    pub command_id: u32,
    pub value: Vec<u8>,
}

impl Response {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&(self.status as u16).to_le_bytes());
        header[6..8].copy_from_slice(&0u16.to_le_bytes()); // reserved
        header[8..12].copy_from_slice(&(self.value.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&self.command_id.to_le_bytes());
        w.write_all(&header)?;
        w.write_all(&self.value)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        r.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        let status = Status::from_u16(u16::from_le_bytes(header[4..6].try_into().unwrap()))?;
        let value_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let command_id = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut value = vec![0u8; value_len];
        r.read_exact(&mut value)?;
        Ok(Self {
            status,
            command_id,
            value,
        })
    }
}

/// Encode a `LIST` response payload: a sequence of
/// `(u16 key-len, key, u32 value-len, value)` tuples.
pub fn encode_list_payload(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in entries {
        out.extend_from_slice(&(k.len() as u16).to_le_bytes());
        out.extend_from_slice(k);
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        out.extend_from_slice(v);
    }
    out
}

/// Decode a `LIST` response payload produced by [`encode_list_payload`].
pub fn decode_list_payload(mut data: &[u8]) -> io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "list payload"));
        }
        let key_len = u16::from_le_bytes(data[0..2].try_into().unwrap()) as usize;
        data = &data[2..];
        if data.len() < key_len + 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "list payload"));
        }
        let key = data[..key_len].to_vec();
        data = &data[key_len..];
        let value_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        data = &data[4..];
        if data.len() < value_len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "list payload"));
        }
        let value = data[..value_len].to_vec();
        data = &data[value_len..];
        entries.push((key, value));
    }
    Ok(entries)
}
