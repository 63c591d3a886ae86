//! Network Block Device server, exporting local files or block devices.
//!
//! Implements the fixed-newstyle handshake with the LIST, GO,
//! STRUCTURED_REPLY and ABORT options, then a transmission phase with read,
//! write and disconnect commands, framed as simple or structured replies as
//! negotiated.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.

#![deny(missing_docs)]
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use std::io::prelude::*;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::{info, warn};

use crate::export::{Blocks, Export, Registry, DEFAULT_EXPORT};
use crate::proto::*;

/// Server implements the NBD protocol over any number of named exports.
#[derive(Debug)]
pub struct Server<F> {
    registry: Registry<F>,
}

impl<F: Blocks> Server<F> {
    /// Create a Server exposing the exports in `registry`.
    pub fn new(registry: Registry<F>) -> Self {
        Self { registry }
    }

    // agree on basic negotiation flags (only fixed newstyle is supported, so
    // the exchange either succeeds or the connection is torn down)
    fn initial_handshake<IO: Read + Write>(stream: &mut IO) -> Result<()> {
        stream.write_u64::<BE>(MAGIC)?;
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream
            .write_u16::<BE>((HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES).bits())?;
        stream.flush()?;
        let client_flags = stream.read_u32::<BE>()?;
        let client_flags = ClientHandshakeFlags::from_bits(client_flags)
            .ok_or_else(|| ProtocolError::new(format!("unexpected client flags {client_flags}")))?;
        if client_flags == ClientHandshakeFlags::C_NO_ZEROES {
            bail!(ProtocolError::new(
                "client requested unfixed newstyle negotiation"
            ));
        }
        if client_flags
            != (ClientHandshakeFlags::C_FIXED_NEWSTYLE | ClientHandshakeFlags::C_NO_ZEROES)
        {
            bail!(ProtocolError::new(format!(
                "unsupported client flags {client_flags:?}"
            )));
        }
        Ok(())
    }

    fn send_export_list<IO: Write>(&self, stream: &mut IO) -> Result<()> {
        let names = self.registry.names().map(str::to_string).collect();
        ExportList::new(names).put(stream)
    }

    /// Send the INFO reply describing `export`, then the ACK that moves the
    /// connection into the transmission phase.
    fn send_export_info<IO: Write>(stream: &mut IO, option: u32, export: &Export<F>) -> Result<()> {
        // NBD_INFO_EXPORT is mandatory before a successful completion of
        // NBD_OPT_GO. length MUST be 12, and the reply payload is interpreted
        // as follows:
        //
        // - 16 bits, NBD_INFO_EXPORT
        // - 64 bits, size of the export in bytes (unsigned)
        // - 16 bits, transmission flags
        let mut buf = vec![];
        buf.write_u16::<BE>(InfoType::EXPORT.into())?;
        buf.write_u64::<BE>(export.size())?;
        buf.write_u16::<BE>(export.transmit_flags().bits())?;
        OptReply::new(option, ReplyType::INFO, buf).put(stream)?;
        OptReply::ack(option).put(stream)?;
        Ok(())
    }

    /// Resolve a GO option to an export, an empty requested name selecting
    /// the `"default"` export. Failures reply with `ERR_UNKNOWN` and then
    /// tear the connection down.
    fn go<'a, IO: Read + Write>(&'a self, stream: &mut IO, opt: &Opt) -> Result<&'a Export<F>> {
        let req = match GoRequest::parse(&opt.data) {
            Ok(req) => req,
            Err(err) => {
                OptReply::error(opt.option, ReplyType::ERR_UNKNOWN, "malformed GO option data")
                    .put(stream)?;
                return Err(err).wrap_err("parsing GO option data");
            }
        };
        if !req.info_types.is_empty() {
            // requested info items are allowed but not consulted; EXPORT info
            // is always what comes back
            info!(target: "nbd", "ignoring requested info items {:?}", req.info_types);
        }
        let name = if req.name.is_empty() {
            DEFAULT_EXPORT
        } else {
            &req.name
        };
        match self.registry.lookup(name) {
            Some(export) => {
                Self::send_export_info(stream, opt.option, export)?;
                Ok(export)
            }
            None => {
                OptReply::error(
                    opt.option,
                    ReplyType::ERR_UNKNOWN,
                    format!("no export named {name:?}"),
                )
                .put(stream)?;
                bail!(ProtocolError::new(format!("export {name:?} not found")));
            }
        }
    }

    /// After the initial handshake, "haggle" to agree on connection
    /// parameters, one option at a time, until the client selects an export
    /// with GO or gives up with ABORT.
    ///
    /// If this returns Ok(None), then the client wants to disconnect.
    fn handshake_haggle<'a, IO: Read + Write>(
        &'a self,
        stream: &mut IO,
    ) -> Result<Option<(&'a Export<F>, bool)>> {
        let mut structured = false;
        loop {
            let opt = Opt::get(stream)?;
            match OptType::try_from(opt.option) {
                Ok(OptType::LIST) => {
                    if !opt.data.is_empty() {
                        OptReply::error(
                            opt.option,
                            ReplyType::ERR_INVALID,
                            "LIST option data must be empty",
                        )
                        .put(stream)?;
                        bail!(ProtocolError::new("non-empty LIST option data"));
                    }
                    self.send_export_list(stream)?;
                }
                Ok(OptType::STRUCTURED_REPLY) => {
                    if !opt.data.is_empty() {
                        OptReply::error(
                            opt.option,
                            ReplyType::ERR_INVALID,
                            "STRUCTURED_REPLY option data must be empty",
                        )
                        .put(stream)?;
                        bail!(ProtocolError::new("non-empty STRUCTURED_REPLY option data"));
                    }
                    structured = true;
                    OptReply::ack(opt.option).put(stream)?;
                }
                Ok(OptType::GO) => {
                    let export = self.go(stream, &opt)?;
                    return Ok(Some((export, structured)));
                }
                Ok(OptType::ABORT) => {
                    return Ok(None);
                }
                Err(_) => {
                    warn!(target: "nbd", "got unsupported option {}", opt.option);
                    OptReply::error(opt.option, ReplyType::ERR_UNSUP, "unsupported option")
                        .put(stream)?;
                }
            }
        }
    }

    fn handle_ops<IO: Read + Write>(
        export: &Export<F>,
        structured: bool,
        stream: &mut IO,
    ) -> Result<()> {
        loop {
            let req = match Request::get(stream)? {
                Some(req) => req,
                None => {
                    // client closed the connection at a request boundary
                    return Ok(());
                }
            };
            info!(target: "nbd", "{:?}", req);
            match req.typ {
                Cmd::READ => {
                    let mut buf = vec![0u8; req.len as usize];
                    export
                        .read(req.offset, &mut buf)
                        .wrap_err_with(|| format!("read at {} failed", req.offset))?;
                    if structured {
                        StructuredReply::offset_data(&req, &buf).put(stream)?;
                    } else {
                        SimpleReply::data(&req, &buf).put(stream)?;
                    }
                }
                Cmd::WRITE => {
                    export
                        .write(req.offset, &req.data)
                        .wrap_err_with(|| format!("write at {} failed", req.offset))?;
                    if structured {
                        StructuredReply::none(&req).put(stream)?;
                    } else {
                        SimpleReply::ok(&req).put(stream)?;
                    }
                }
                Cmd::DISCONNECT => {
                    // no reply; the client closes its end as soon as the
                    // request is on the wire
                    return Ok(());
                }
            }
        }
    }

    /// Handshake and communicate with a client on a single connection.
    ///
    /// Returns Ok(()) when the client gracefully disconnects.
    pub fn handle_client<IO: Read + Write>(&self, stream: &mut IO) -> Result<()> {
        Self::initial_handshake(stream).wrap_err("initial handshake failed")?;
        if let Some((export, structured)) = self
            .handshake_haggle(stream)
            .wrap_err("handshake haggling failed")?
        {
            info!(target: "nbd", "negotiated export {:?} (structured replies: {structured})",
                  export.name());
            Self::handle_ops(export, structured, stream).wrap_err("handling client operations")?;
        }
        Ok(())
    }
}

impl<F: Blocks + Send + Sync + 'static> Server<F> {
    /// Start accepting connections from clients and processing commands, one
    /// thread per connection.
    ///
    /// The registry is shared read-only between connections; an error on one
    /// connection tears that connection down and leaves the listener running.
    pub fn start(self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .wrap_err_with(|| format!("binding port {port}"))?;
        info!(target: "nbd", "listening on port {port}");
        let server = Arc::new(self);
        for stream in listener.incoming() {
            let mut stream = stream?;
            stream.set_nodelay(true)?;
            let peer = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            info!(target: "nbd", "client connected from {peer}");
            let server = Arc::clone(&server);
            thread::spawn(move || match server.handle_client(&mut stream) {
                Ok(()) => info!(target: "nbd", "client {peer} disconnected"),
                Err(err) => warn!(target: "nbd", "error handling client {peer}: {err:#}"),
            });
        }
        Ok(())
    }
}
