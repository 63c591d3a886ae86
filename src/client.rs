//! Basic NBD client that works with this crate's server.

use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;

use std::io::prelude::*;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::proto::*;

/// Client provides an interface to one export of a remote NBD server.
#[derive(Debug)]
pub struct Client<IO> {
    conn: IO,
    size: u64,
    flags: TransmitFlags,
    structured: bool,
    next_handle: u64,
}

impl<IO: Read + Write> Client<IO> {
    fn initial_handshake(stream: &mut IO) -> Result<()> {
        let magic = stream.read_u64::<BE>()?;
        if magic != MAGIC {
            bail!(ProtocolError::new(format!("unexpected magic {magic:#x}")));
        }
        let opt_magic = stream.read_u64::<BE>()?;
        if opt_magic != IHAVEOPT {
            bail!(ProtocolError::new(format!(
                "unexpected IHAVEOPT value {opt_magic:#x}",
            )))
        }
        let server_flags = stream.read_u16::<BE>()?;
        let server_flags = HandshakeFlags::from_bits(server_flags)
            .ok_or_else(|| ProtocolError::new(format!("unexpected server flags {server_flags}")))?;
        if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES) {
            bail!(ProtocolError::new(
                "server does not support fixed newstyle negotiation"
            ));
        }
        let client_flags =
            ClientHandshakeFlags::C_FIXED_NEWSTYLE | ClientHandshakeFlags::C_NO_ZEROES;
        stream.write_u32::<BE>(client_flags.bits())?;
        stream.flush()?;
        Ok(())
    }

    fn expect_ack(stream: &mut IO, what: &str) -> Result<()> {
        let reply = OptReply::get(stream)?;
        match ReplyType::try_from(reply.reply_type) {
            Ok(ReplyType::ACK) => Ok(()),
            _ => bail!(ProtocolError::new(format!(
                "server rejected {what}: {}",
                String::from_utf8_lossy(&reply.data)
            ))),
        }
    }

    fn negotiate_structured(stream: &mut IO) -> Result<()> {
        Opt::new(OptType::STRUCTURED_REPLY, vec![]).put(stream)?;
        Self::expect_ack(stream, "structured replies")
    }

    /// Select `export` with GO and collect the export info the server sends
    /// back before its ACK.
    fn go(stream: &mut IO, export: &str) -> Result<(u64, TransmitFlags)> {
        Opt::new(OptType::GO, GoRequest::encode(export)).put(stream)?;
        let mut info = None;
        loop {
            let reply = OptReply::get(stream)?;
            match ReplyType::try_from(reply.reply_type) {
                Ok(ReplyType::INFO) => {
                    let mut data = &reply.data[..];
                    let typ = data.read_u16::<BE>()?;
                    if typ == u16::from(InfoType::EXPORT) {
                        let size = data.read_u64::<BE>()?;
                        let flags = TransmitFlags::from_bits_truncate(data.read_u16::<BE>()?);
                        info = Some((size, flags));
                    }
                }
                Ok(ReplyType::ACK) => break,
                _ => bail!(ProtocolError::new(format!(
                    "server rejected export {export:?}: {}",
                    String::from_utf8_lossy(&reply.data)
                ))),
            }
        }
        match info {
            Some(info) => Ok(info),
            None => bail!(ProtocolError::new("server sent no export info before ACK")),
        }
    }

    /// Negotiate an export over `conn` and return a Client ready for use.
    ///
    /// An empty export name selects the server's default export. When
    /// `structured` is true the structured-reply extension is negotiated
    /// before selecting the export.
    pub fn new(mut conn: IO, export: &str, structured: bool) -> Result<Self> {
        Self::initial_handshake(&mut conn)?;
        if structured {
            Self::negotiate_structured(&mut conn)?;
        }
        let (size, flags) = Self::go(&mut conn, export)?;
        Ok(Self {
            conn,
            size,
            flags,
            structured,
            next_handle: 0,
        })
    }

    /// List the names of the server's exports, then end the session.
    pub fn list(mut conn: IO) -> Result<Vec<String>> {
        Self::initial_handshake(&mut conn)?;
        Opt::new(OptType::LIST, vec![]).put(&mut conn)?;
        let mut names = vec![];
        loop {
            let reply = OptReply::get(&mut conn)?;
            match ReplyType::try_from(reply.reply_type) {
                Ok(ReplyType::SERVER) => {
                    let mut data = &reply.data[..];
                    let len = data.read_u32::<BE>()? as usize;
                    ensure!(len <= data.len(), ProtocolError::new("malformed LIST reply"));
                    let name = String::from_utf8(data[..len].to_vec())
                        .map_err(|_| ProtocolError::new("non-UTF8 export name"))?;
                    names.push(name);
                }
                Ok(ReplyType::ACK) => break,
                _ => bail!(ProtocolError::new(format!(
                    "server rejected LIST: {}",
                    String::from_utf8_lossy(&reply.data)
                ))),
            }
        }
        Opt::new(OptType::ABORT, vec![]).put(&mut conn)?;
        Ok(names)
    }

    /// Return the size of this export, as reported by the server during the
    /// handshake.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True if the server marked the export read-only.
    pub fn read_only(&self) -> bool {
        self.flags.contains(TransmitFlags::READ_ONLY)
    }

    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    // reassemble OFFSET_DATA chunks into buf until the DONE chunk arrives
    fn get_read_chunks(&mut self, offset: u64, buf: &mut [u8], handle: u64) -> Result<()> {
        loop {
            let chunk = StructuredChunk::get(&mut self.conn)?;
            ensure!(
                chunk.handle == handle,
                ProtocolError::new("reply handle mismatch")
            );
            match chunk.typ {
                ChunkType::OFFSET_DATA => {
                    let mut data = &chunk.data[..];
                    let chunk_offset = data.read_u64::<BE>()?;
                    let start = chunk_offset
                        .checked_sub(offset)
                        .ok_or_else(|| ProtocolError::new("chunk offset before request"))?
                        as usize;
                    ensure!(
                        start + data.len() <= buf.len(),
                        ProtocolError::new("chunk runs past the end of the request")
                    );
                    buf[start..start + data.len()].copy_from_slice(data);
                }
                ChunkType::NONE => {}
            }
            if chunk.flags.contains(ChunkFlags::DONE) {
                return Ok(());
            }
        }
    }

    /// Send a read command to the NBD server.
    pub fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let handle = self.fresh_handle();
        Request::new(Cmd::READ, handle, offset, len).put(&[], &mut self.conn)?;
        let mut buf = vec![0u8; len as usize];
        if self.structured {
            self.get_read_chunks(offset, &mut buf, handle)?;
        } else {
            let (err, reply_handle) = SimpleReply::get(&mut self.conn, &mut buf)?;
            ensure!(
                reply_handle == handle,
                ProtocolError::new("reply handle mismatch")
            );
            if err != ErrorType::OK {
                bail!(ProtocolError::new(format!("read failed: {err:?}")));
            }
        }
        Ok(buf)
    }

    /// Send a write command to the NBD server.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let handle = self.fresh_handle();
        Request::new(Cmd::WRITE, handle, offset, data.len() as u32).put(data, &mut self.conn)?;
        if self.structured {
            let chunk = StructuredChunk::get(&mut self.conn)?;
            ensure!(
                chunk.handle == handle,
                ProtocolError::new("reply handle mismatch")
            );
            ensure!(
                chunk.typ == ChunkType::NONE && chunk.flags.contains(ChunkFlags::DONE),
                ProtocolError::new("unexpected reply chunk to a write")
            );
        } else {
            let (err, reply_handle) = SimpleReply::get(&mut self.conn, &mut [])?;
            ensure!(
                reply_handle == handle,
                ProtocolError::new("reply handle mismatch")
            );
            if err != ErrorType::OK {
                bail!(ProtocolError::new(format!("write failed: {err:?}")));
            }
        }
        Ok(())
    }

    /// Tell the server to end the session. No reply is expected.
    pub fn disconnect(mut self) -> Result<()> {
        let handle = self.fresh_handle();
        Request::new(Cmd::DISCONNECT, handle, 0, 0).put(&[], &mut self.conn)?;
        Ok(())
    }
}
