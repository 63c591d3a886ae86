//! NBD protocol constants and struct definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*, ErrorKind};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub(crate) const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub(crate) const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub(crate) const OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub(crate) const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Largest option payload the server will buffer.
pub(crate) const MAX_OPTION_LEN: u32 = 10_000;

/// Largest read or write transfer accepted in a single request.
pub(crate) const MAX_IO_LEN: u32 = 32 << 20;

#[derive(Debug, Clone)]
pub(crate) struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub(crate) struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub(crate) struct ClientHandshakeFlags: u32 {
    const C_FIXED_NEWSTYLE = 0b01;
    const C_NO_ZEROES = 0b10;
  }

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub(crate) struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
  }

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub(crate) struct CmdFlags: u16 {
    const FUA = 1 << 0;
    const NO_HOLE = 1 << 1;
    // "don't fragment"
    const DF = 1 << 2;
    const REQ_ONE = 1 << 3;
    const FAST_ZERO = 1 << 4;
  }

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub(crate) struct ChunkFlags: u16 {
    const DONE = 1 << 0;
  }
}

/// Options supported by the server; any other id draws `ERR_UNSUP`.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum OptType {
    ABORT = 2,
    LIST = 3,
    GO = 7,
    STRUCTURED_REPLY = 8,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone)]
#[repr(u16)]
pub(crate) enum InfoType {
    EXPORT = 0,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    ERR_UNSUP = (1 << 31) + 1,
    ERR_INVALID = (1 << 31) + 3,
    ERR_UNKNOWN = (1 << 31) + 6,
}

/// An option request sent by the client during the handshake.
///
/// The option id is kept raw so unknown options can be answered with
/// `ERR_UNSUP` rather than failing the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Opt {
    pub option: u32,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn new(typ: OptType, data: Vec<u8>) -> Self {
        Self {
            option: typ.into(),
            data,
        }
    }

    pub fn get<IO: Read>(stream: &mut IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT') (note same newstyle handshake's magic number)
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError(format!("unexpected option magic {magic}")));
        }
        let option = stream.read_u32::<BE>()?;
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len < MAX_OPTION_LEN,
            ProtocolError(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {option} of size {option_len}"))?;
        Ok(Self { option, data })
    }

    pub fn put<IO: Write>(&self, stream: &mut IO) -> io::Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.option)?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// Builder for replying to an option
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OptReply {
    pub option: u32,
    pub reply_type: u32,
    pub data: Vec<u8>,
}

impl OptReply {
    pub fn ack(option: u32) -> Self {
        Self {
            option,
            reply_type: ReplyType::ACK.into(),
            data: vec![],
        }
    }

    pub fn new(option: u32, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self {
            option,
            reply_type: reply_type.into(),
            data,
        }
    }

    /// An error reply carrying a human-readable diagnostic for the client.
    pub fn error<S: AsRef<str>>(option: u32, reply_type: ReplyType, msg: S) -> Self {
        Self::new(option, reply_type, msg.as_ref().as_bytes().to_vec())
    }

    pub fn put<IO: Write>(self, stream: &mut IO) -> io::Result<()> {
        // The server will reply to any option apart from NBD_OPT_EXPORT_NAME with reply packets in the following format:
        //
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type (e.g., NBD_REP_ACK for successful completion, or NBD_REP_ERR_UNSUP to mark use of an option not known by this server
        // S: 32 bits, length of the reply. This MAY be zero for some replies, in which case the next field is not sent
        // S: any data as required by the reply (e.g., an export name in the case of NBD_REP_SERVER)
        stream.write_u64::<BE>(OPTION_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.option)?;
        stream.write_u32::<BE>(self.reply_type)?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }

    pub fn get<IO: Read>(stream: &mut IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        if magic != OPTION_REPLY_MAGIC {
            bail!(ProtocolError(format!("unexpected reply magic {magic}")));
        }
        let option = stream.read_u32::<BE>()?;
        let reply_type = stream.read_u32::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        ensure!(
            len < MAX_OPTION_LEN,
            ProtocolError(format!("reply length {len} is too large"))
        );
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self {
            option,
            reply_type,
            data,
        })
    }
}

/// Builder for the replies to an OptType::LIST option request
#[must_use]
pub(crate) struct ExportList {
    export_names: Vec<String>,
}

impl ExportList {
    pub fn new(export_names: Vec<String>) -> Self {
        Self { export_names }
    }

    pub fn put<IO: Write>(self, stream: &mut IO) -> Result<()> {
        // Return zero or more NBD_REP_SERVER replies, one for each export,
        // followed by NBD_REP_ACK or an error.
        for name in self.export_names.into_iter() {
            let mut data = vec![];
            data.write_u32::<BE>(name.len() as u32)?;
            data.write_all(name.as_bytes())?;
            OptReply::new(OptType::LIST.into(), ReplyType::SERVER, data).put(stream)?;
        }
        OptReply::ack(OptType::LIST.into()).put(stream)?;
        Ok(())
    }
}

/// The decoded payload of a GO option: the requested export name and the
/// info ids the client would like described.
#[derive(Debug, Clone)]
pub(crate) struct GoRequest {
    pub name: String,
    pub info_types: Vec<u16>,
}

impl GoRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut rd = data;
        ensure!(
            data.len() >= 6,
            ProtocolError(format!("GO option data of {} bytes is too short", data.len()))
        );
        let name_len = rd.read_u32::<BE>()?;
        ensure!(
            name_len as usize <= data.len() - 6,
            ProtocolError(format!("export name length {name_len} exceeds option data"))
        );
        let mut name = vec![0u8; name_len as usize];
        rd.read_exact(&mut name)?;
        let name =
            String::from_utf8(name).wrap_err(ProtocolError::new("non-UTF8 export name"))?;
        let num_requests = rd.read_u16::<BE>()?;
        let mut info_types = vec![];
        for _ in 0..num_requests {
            info_types.push(rd.read_u16::<BE>().wrap_err(ProtocolError::new(
                "GO option data too short for its info requests",
            ))?);
        }
        Ok(Self { name, info_types })
    }

    /// Encode a GO payload requesting `name` and no particular info items.
    pub fn encode(name: &str) -> Vec<u8> {
        let mut data = vec![];
        data.extend_from_slice(&(name.len() as u32).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data
    }
}

// -------------------
// Transmission phase
// -------------------

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
}

/// Structured reply chunk types; OFFSET_DATA is the only payload-bearing
/// chunk the server emits.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum ChunkType {
    NONE = 0,
    OFFSET_DATA = 1,
}

pub(crate) struct Request {
    // parsed but currently ignored
    flags: CmdFlags,
    pub typ: Cmd,
    pub handle: u64,
    pub offset: u64,
    // used for READ (redundant for WRITE)
    pub len: u32,
    // payload of a WRITE request
    pub data: Vec<u8>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = &mut f.debug_struct("Request");
        if !self.flags.is_empty() {
            f = f.field("flags", &self.flags);
        }
        f = f.field("typ", &self.typ);
        if self.typ == Cmd::READ || self.typ == Cmd::WRITE {
            f = f.field("offset", &self.offset);
        }
        if self.len != 0 {
            f = f.field("len", &self.len);
        }
        f.finish_non_exhaustive()
    }
}

impl Request {
    pub fn new(typ: Cmd, handle: u64, offset: u64, len: u32) -> Self {
        Self {
            flags: CmdFlags::empty(),
            typ,
            handle,
            offset,
            len,
            data: vec![],
        }
    }

    /// Read one request, consuming the payload of a WRITE along with its
    /// header. Returns None if the client closed the connection at the
    /// request boundary.
    pub fn get<IO: Read>(stream: &mut IO) -> Result<Option<Self>> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, handle
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        let mut magic = [0u8; 4];
        match stream.read_exact(&mut magic) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).wrap_err("reading request magic"),
        }
        let magic = u32::from_be_bytes(magic);
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError(format!("wrong request magic {}", magic)));
        }
        let flags = CmdFlags::from_bits_truncate(stream.read_u16::<BE>()?);
        let typ = stream.read_u16::<BE>()?;
        let typ =
            Cmd::try_from(typ).map_err(|_| ProtocolError(format!("unexpected command {}", typ)))?;
        let handle = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        ensure!(
            len <= MAX_IO_LEN,
            ProtocolError(format!("request length {len} is too large"))
        );
        let data = if typ == Cmd::WRITE {
            let mut buf = vec![0u8; len as usize];
            stream
                .read_exact(&mut buf)
                .wrap_err_with(|| format!("parsing write request of length {len}"))?;
            buf
        } else {
            vec![]
        };
        Ok(Some(Self {
            flags,
            typ,
            handle,
            offset,
            len,
            data,
        }))
    }

    pub fn put<IO: Write>(&self, data: &[u8], stream: &mut IO) -> io::Result<()> {
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ErrorType {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

#[derive(Debug)]
#[must_use]
pub(crate) struct SimpleReply<'a> {
    err: ErrorType,
    handle: u64,
    data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    pub fn data(req: &Request, data: &'a [u8]) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            handle: req.handle,
            data,
        }
    }

    pub fn ok(req: &Request) -> Self {
        Self::data(req, &[])
    }

    pub fn put<IO: Write>(self, stream: &mut IO) -> io::Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_all(self.data)?;
        stream.flush()?;
        Ok(())
    }

    /// Read a simple reply header and, on success, exactly `buf.len()`
    /// payload bytes. Returns the error code and the echoed handle.
    pub fn get<IO: Read>(stream: &mut IO, buf: &mut [u8]) -> Result<(ErrorType, u64)> {
        let magic = stream.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError(format!("unexpected reply magic {magic}")));
        }
        let err = stream.read_u32::<BE>()?;
        let err = ErrorType::try_from(err)
            .map_err(|_| ProtocolError(format!("unexpected error code {err}")))?;
        let handle = stream.read_u64::<BE>()?;
        if err == ErrorType::OK {
            stream.read_exact(buf)?;
        }
        Ok((err, handle))
    }
}

/// Builder for one chunk of a structured reply.
#[must_use]
pub(crate) struct StructuredReply<'a> {
    flags: ChunkFlags,
    typ: ChunkType,
    handle: u64,
    offset: Option<u64>,
    data: &'a [u8],
}

impl<'a> StructuredReply<'a> {
    /// The single OFFSET_DATA chunk answering a READ, carrying the request
    /// offset and the data read there.
    pub fn offset_data(req: &Request, data: &'a [u8]) -> Self {
        StructuredReply {
            flags: ChunkFlags::DONE,
            typ: ChunkType::OFFSET_DATA,
            handle: req.handle,
            offset: Some(req.offset),
            data,
        }
    }

    /// An empty terminal chunk, acknowledging a WRITE.
    pub fn none(req: &Request) -> Self {
        StructuredReply {
            flags: ChunkFlags::DONE,
            typ: ChunkType::NONE,
            handle: req.handle,
            offset: None,
            data: &[],
        }
    }

    pub fn put<IO: Write>(self, stream: &mut IO) -> io::Result<()> {
        stream.write_u32::<BE>(STRUCTURED_REPLY_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        let len = self.data.len() + if self.offset.is_some() { 8 } else { 0 };
        stream.write_u32::<BE>(len as u32)?;
        if let Some(offset) = self.offset {
            stream.write_u64::<BE>(offset)?;
        }
        stream.write_all(self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// A single decoded chunk of a structured reply. For OFFSET_DATA chunks the
/// payload starts with the 8-byte big-endian offset.
#[derive(Debug, Clone)]
pub(crate) struct StructuredChunk {
    pub flags: ChunkFlags,
    pub typ: ChunkType,
    pub handle: u64,
    pub data: Vec<u8>,
}

impl StructuredChunk {
    pub fn get<IO: Read>(stream: &mut IO) -> Result<Self> {
        let magic = stream.read_u32::<BE>()?;
        if magic != STRUCTURED_REPLY_MAGIC {
            bail!(ProtocolError(format!("unexpected chunk magic {magic}")));
        }
        let flags = stream.read_u16::<BE>()?;
        let flags = ChunkFlags::from_bits(flags)
            .ok_or_else(|| ProtocolError(format!("unexpected chunk flags {flags}")))?;
        let typ = stream.read_u16::<BE>()?;
        let typ = ChunkType::try_from(typ)
            .map_err(|_| ProtocolError(format!("unexpected chunk type {typ}")))?;
        let handle = stream.read_u64::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        ensure!(
            len <= MAX_IO_LEN + 8,
            ProtocolError(format!("chunk length {len} is too large"))
        );
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self {
            flags,
            typ,
            handle,
            data,
        })
    }
}
