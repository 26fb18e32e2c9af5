use portal_network_core::{BlockPos, EndpointId, ResourceId};

pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_STRING_LEN: usize = 32767;

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;
const MAX_VARINT_BYTES: usize = 10;

const DEVICE_KIND_HELLO: u8 = 0;
const DEVICE_KIND_LIST_REQUEST: u8 = 1;
const DEVICE_KIND_CONNECT: u8 = 2;
const DEVICE_KIND_DISCONNECT: u8 = 3;
const DEVICE_KIND_RENAME: u8 = 4;

const SERVER_KIND_ENDPOINT_LIST: u8 = 0;
const SERVER_KIND_STATUS: u8 = 1;
const SERVER_KIND_NAME: u8 = 2;
const SERVER_KIND_CONNECTION_ERROR: u8 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("string of {0} bytes exceeds the protocol limit")]
    StringTooLong(usize),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Device to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Hello {
        dimension: ResourceId,
    },
    EndpointListRequest {
        device_pos: BlockPos,
    },
    ConnectRequest {
        device_pos: BlockPos,
        target_id: EndpointId,
    },
    DisconnectRequest {
        device_pos: BlockPos,
    },
    RenameRequest {
        anchor_pos: BlockPos,
        name: String,
    },
}

impl DeviceMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DeviceMessage::Hello { .. } => "hello",
            DeviceMessage::EndpointListRequest { .. } => "list",
            DeviceMessage::ConnectRequest { .. } => "connect",
            DeviceMessage::DisconnectRequest { .. } => "disconnect",
            DeviceMessage::RenameRequest { .. } => "rename",
        }
    }
}

/// One row of an endpoint snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEntry {
    pub id: EndpointId,
    pub name: String,
    pub dimension: ResourceId,
    pub position: BlockPos,
    pub cost: u64,
}

impl EndpointEntry {
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.id.short()
        } else {
            self.name.clone()
        }
    }
}

/// Server to device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    EndpointListResponse {
        device_pos: BlockPos,
        entries: Vec<EndpointEntry>,
    },
    StatusResponse {
        anchor_pos: BlockPos,
        active: bool,
        disconnect_allowed: bool,
    },
    NameResponse {
        anchor_pos: BlockPos,
        name: String,
    },
    ConnectionError {
        message: String,
    },
}

pub fn encode_device_message(message: &DeviceMessage) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(32);
    match message {
        DeviceMessage::Hello { dimension } => {
            write_header(&mut buf, DEVICE_KIND_HELLO);
            write_string(&mut buf, &dimension.to_string())?;
        }
        DeviceMessage::EndpointListRequest { device_pos } => {
            write_header(&mut buf, DEVICE_KIND_LIST_REQUEST);
            write_pos(&mut buf, device_pos);
        }
        DeviceMessage::ConnectRequest {
            device_pos,
            target_id,
        } => {
            write_header(&mut buf, DEVICE_KIND_CONNECT);
            write_pos(&mut buf, device_pos);
            write_id(&mut buf, target_id);
        }
        DeviceMessage::DisconnectRequest { device_pos } => {
            write_header(&mut buf, DEVICE_KIND_DISCONNECT);
            write_pos(&mut buf, device_pos);
        }
        DeviceMessage::RenameRequest { anchor_pos, name } => {
            write_header(&mut buf, DEVICE_KIND_RENAME);
            write_pos(&mut buf, anchor_pos);
            write_string(&mut buf, name)?;
        }
    }
    Ok(buf)
}

pub fn decode_device_message(bytes: &[u8]) -> Result<DeviceMessage, WireError> {
    let mut cursor = Cursor::new(bytes);
    let (kind, _) = read_header(&mut cursor)?;
    let message = match kind {
        DEVICE_KIND_HELLO => DeviceMessage::Hello {
            dimension: read_resource_id(&mut cursor)?,
        },
        DEVICE_KIND_LIST_REQUEST => DeviceMessage::EndpointListRequest {
            device_pos: cursor.read_pos()?,
        },
        DEVICE_KIND_CONNECT => {
            let device_pos = cursor.read_pos()?;
            let target_id = cursor.read_id()?;
            DeviceMessage::ConnectRequest {
                device_pos,
                target_id,
            }
        }
        DEVICE_KIND_DISCONNECT => DeviceMessage::DisconnectRequest {
            device_pos: cursor.read_pos()?,
        },
        DEVICE_KIND_RENAME => {
            let anchor_pos = cursor.read_pos()?;
            let name = cursor.read_string()?;
            DeviceMessage::RenameRequest { anchor_pos, name }
        }
        other => return Err(WireError::UnknownMessageKind(other)),
    };
    cursor.finish()?;
    Ok(message)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(64);
    match message {
        ServerMessage::EndpointListResponse {
            device_pos,
            entries,
        } => {
            write_header(&mut buf, SERVER_KIND_ENDPOINT_LIST);
            write_pos(&mut buf, device_pos);
            write_var_u64(&mut buf, entries.len() as u64);
            for entry in entries {
                write_id(&mut buf, &entry.id);
                write_string(&mut buf, &entry.name)?;
                write_string(&mut buf, &entry.dimension.to_string())?;
                write_pos(&mut buf, &entry.position);
                write_var_u64(&mut buf, entry.cost);
            }
        }
        ServerMessage::StatusResponse {
            anchor_pos,
            active,
            disconnect_allowed,
        } => {
            write_header(&mut buf, SERVER_KIND_STATUS);
            write_pos(&mut buf, anchor_pos);
            buf.push(*active as u8);
            buf.push(*disconnect_allowed as u8);
        }
        ServerMessage::NameResponse { anchor_pos, name } => {
            write_header(&mut buf, SERVER_KIND_NAME);
            write_pos(&mut buf, anchor_pos);
            write_string(&mut buf, name)?;
        }
        ServerMessage::ConnectionError { message } => {
            write_header(&mut buf, SERVER_KIND_CONNECTION_ERROR);
            write_string(&mut buf, message)?;
        }
    }
    Ok(buf)
}

pub fn decode_server_message(bytes: &[u8]) -> Result<ServerMessage, WireError> {
    let mut cursor = Cursor::new(bytes);
    let (kind, _) = read_header(&mut cursor)?;
    let message = match kind {
        SERVER_KIND_ENDPOINT_LIST => {
            let device_pos = cursor.read_pos()?;
            let count = cursor.read_var_u64()?;
            // Each entry needs at least 16 + 1 + 1 + 12 + 1 bytes.
            if count > (cursor.remaining() / 31) as u64 {
                return Err(WireError::InvalidData("entry count exceeds payload"));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let id = cursor.read_id()?;
                let name = cursor.read_string()?;
                let dimension = read_resource_id(&mut cursor)?;
                let position = cursor.read_pos()?;
                let cost = cursor.read_var_u64()?;
                entries.push(EndpointEntry {
                    id,
                    name,
                    dimension,
                    position,
                    cost,
                });
            }
            ServerMessage::EndpointListResponse {
                device_pos,
                entries,
            }
        }
        SERVER_KIND_STATUS => {
            let anchor_pos = cursor.read_pos()?;
            let active = cursor.read_bool()?;
            let disconnect_allowed = cursor.read_bool()?;
            ServerMessage::StatusResponse {
                anchor_pos,
                active,
                disconnect_allowed,
            }
        }
        SERVER_KIND_NAME => {
            let anchor_pos = cursor.read_pos()?;
            let name = cursor.read_string()?;
            ServerMessage::NameResponse { anchor_pos, name }
        }
        SERVER_KIND_CONNECTION_ERROR => ServerMessage::ConnectionError {
            message: cursor.read_string()?,
        },
        other => return Err(WireError::UnknownMessageKind(other)),
    };
    cursor.finish()?;
    Ok(message)
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<(u8, u8), WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    let kind = byte & TYPE_MASK;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok((kind, version))
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_pos(buf: &mut Vec<u8>, pos: &BlockPos) {
    write_i32(buf, pos.x);
    write_i32(buf, pos.y);
    write_i32(buf, pos.z);
}

fn write_id(buf: &mut Vec<u8>, id: &EndpointId) {
    let (most, least) = id.as_u64_pair();
    buf.extend_from_slice(&most.to_be_bytes());
    buf.extend_from_slice(&least.to_be_bytes());
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), WireError> {
    if value.len() > MAX_STRING_LEN {
        return Err(WireError::StringTooLong(value.len()));
    }
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn read_resource_id(cursor: &mut Cursor<'_>) -> Result<ResourceId, WireError> {
    cursor
        .read_string()?
        .parse()
        .map_err(|_| WireError::InvalidData("invalid resource id"))
}

#[derive(Clone, Copy)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        for index in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            // The tenth byte may only carry the top bit of a u64.
            if index == MAX_VARINT_BYTES - 1 && byte > 0x01 {
                return Err(WireError::VarIntOverflow);
            }
            result |= ((byte & 0x7F) as u64) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    fn read_pos(&mut self) -> Result<BlockPos, WireError> {
        let x = self.read_i32()?;
        let y = self.read_i32()?;
        let z = self.read_i32()?;
        Ok(BlockPos::new(x, y, z))
    }

    fn read_id(&mut self) -> Result<EndpointId, WireError> {
        let most = self.read_u64()?;
        let least = self.read_u64()?;
        Ok(EndpointId::from_u64_pair(most, least))
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_var_u64()?;
        if len > MAX_STRING_LEN as u64 {
            return Err(WireError::StringTooLong(len as usize));
        }
        let bytes = self.read_bytes(len as usize)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes(extra)),
        }
    }
}
