//! Minimal ONC-RPC (RFC 5531) client over TCP, with XDR encoding.
//!
//! Only what VXI-11 needs: `AUTH_NONE` calls, record marking, accepted
//! replies, and a portmapper `GETPORT` lookup.

use std::time::Duration;

use benchlib_core::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::map_io_error;

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NONE: u32 = 0;

/// Last-fragment bit of a record mark.
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Upper bound on a single reply record.
const MAX_RECORD: usize = 16 * 1024 * 1024;

pub(crate) const PORTMAPPER_PROGRAM: u32 = 100_000;
pub(crate) const PORTMAPPER_VERSION: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

// ---------------------------------------------------------------------------
// XDR
// ---------------------------------------------------------------------------

/// Append variable-length opaque data (length, bytes, zero padding).
pub(crate) fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    let pad = (4 - data.len() % 4) % 4;
    buf.put_bytes(0, pad);
}

/// Bounds-checked XDR reader.
#[derive(Debug)]
pub(crate) struct XdrReader {
    buf: Bytes,
}

impl XdrReader {
    pub(crate) fn new(buf: Bytes) -> Self {
        XdrReader { buf }
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(Error::Protocol("truncated XDR integer".into()));
        }
        Ok(self.buf.get_u32())
    }

    pub(crate) fn opaque(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        let padded = len + (4 - len % 4) % 4;
        if self.buf.remaining() < padded {
            return Err(Error::Protocol(format!(
                "truncated XDR opaque: need {} bytes, have {}",
                padded,
                self.buf.remaining()
            )));
        }
        let data = self.buf.split_to(len);
        self.buf.advance(padded - len);
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Encode a record-marked call message.
pub(crate) fn encode_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(40 + args.len());
    body.put_u32(xid);
    body.put_u32(MSG_CALL);
    body.put_u32(RPC_VERSION);
    body.put_u32(program);
    body.put_u32(version);
    body.put_u32(procedure);
    // Credentials and verifier: AUTH_NONE, empty body.
    body.put_u32(AUTH_NONE);
    body.put_u32(0);
    body.put_u32(AUTH_NONE);
    body.put_u32(0);
    body.put_slice(args);

    let mut record = BytesMut::with_capacity(4 + body.len());
    record.put_u32(LAST_FRAGMENT | body.len() as u32);
    record.extend_from_slice(&body);
    record
}

/// Check a reply header against `xid` and return a reader over the results.
pub(crate) fn decode_reply(xid: u32, record: Bytes) -> Result<XdrReader> {
    let mut reader = XdrReader::new(record);

    let reply_xid = reader.u32()?;
    if reply_xid != xid {
        return Err(Error::Protocol(format!(
            "RPC reply xid {reply_xid:#x} does not match call {xid:#x}"
        )));
    }
    if reader.u32()? != MSG_REPLY {
        return Err(Error::Protocol("RPC message is not a reply".into()));
    }
    let reply_stat = reader.u32()?;
    if reply_stat != MSG_ACCEPTED {
        return Err(Error::Protocol(format!("RPC call rejected (stat {reply_stat})")));
    }
    let _verf_flavor = reader.u32()?;
    let _verf_body = reader.opaque()?;
    let accept_stat = reader.u32()?;
    if accept_stat != ACCEPT_SUCCESS {
        return Err(Error::Protocol(format!("RPC call not executed (stat {accept_stat})")));
    }
    Ok(reader)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A connected RPC client bound to one program/version.
#[derive(Debug)]
pub(crate) struct RpcClient {
    stream: TcpStream,
    addr: String,
    program: u32,
    version: u32,
    xid: u32,
}

impl RpcClient {
    pub(crate) async fn connect(
        addr: &str,
        program: u32,
        version: u32,
        timeout: Duration,
    ) -> Result<Self> {
        tracing::debug!(addr = %addr, program, version, "Connecting RPC client");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("RPC connect to {addr} failed: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY (continuing anyway)");
        }

        Ok(RpcClient {
            stream,
            addr: addr.to_string(),
            program,
            version,
            xid: std::process::id().rotate_left(16),
        })
    }

    /// Issue one call and return a reader over its results.
    pub(crate) async fn call(&mut self, procedure: u32, args: &[u8], timeout: Duration) -> Result<XdrReader> {
        self.xid = self.xid.wrapping_add(1);
        let xid = self.xid;
        let record = encode_call(xid, self.program, self.version, procedure, args);

        tracing::trace!(addr = %self.addr, xid, procedure, bytes = record.len(), "RPC call");

        let reply = tokio::time::timeout(timeout, async {
            self.stream.write_all(&record).await.map_err(map_io_error)?;
            read_record(&mut self.stream).await
        })
        .await
        .map_err(|_| {
            tracing::debug!(addr = %self.addr, xid, procedure, "RPC call timed out");
            Error::Timeout
        })??;

        decode_reply(xid, reply)
    }
}

/// Read one complete record, reassembling fragments.
pub(crate) async fn read_record(stream: &mut TcpStream) -> Result<Bytes> {
    let mut record = BytesMut::new();
    loop {
        let mark = stream.read_u32().await.map_err(map_io_error)?;
        let len = (mark & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            return Err(Error::Protocol(format!("RPC record too large ({} bytes)", record.len() + len)));
        }
        let start = record.len();
        record.resize(start + len, 0);
        stream
            .read_exact(&mut record[start..])
            .await
            .map_err(map_io_error)?;
        if mark & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

/// Ask the portmapper at `host:port` which TCP port serves `program`.
pub(crate) async fn getport(
    host: &str,
    portmapper_port: u16,
    program: u32,
    version: u32,
    timeout: Duration,
) -> Result<u16> {
    let addr = format!("{host}:{portmapper_port}");
    let mut client = RpcClient::connect(&addr, PORTMAPPER_PROGRAM, PORTMAPPER_VERSION, timeout).await?;

    let mut args = BytesMut::with_capacity(16);
    args.put_u32(program);
    args.put_u32(version);
    args.put_u32(IPPROTO_TCP);
    args.put_u32(0);

    let mut reply = client.call(PMAPPROC_GETPORT, &args, timeout).await?;
    let port = reply.u32()?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::Transport(format!(
            "program {program:#x} v{version} not registered with portmapper at {addr}"
        )));
    }
    tracing::debug!(addr = %addr, program, port, "Portmapper lookup");
    Ok(port as u16)
}
