//! VXI-11 transport (SCPI over ONC-RPC).
//!
//! LAN instruments that predate raw-socket SCPI (and many that don't)
//! speak VXI-11: a `DEVICE_CORE` RPC program located through the
//! portmapper, with a link created per client. This transport:
//!
//! 1. asks the portmapper (TCP port 111) for the `DEVICE_CORE` port,
//! 2. calls `create_link` for the instrument name (`inst0` by default)
//!    and records the instrument's maximum receive size,
//! 3. sends commands with `device_write` (END flag set, `\r\n` appended),
//! 4. reads with `device_read`, reporting completion through the
//!    reply's reason bits,
//! 5. calls `destroy_link` on close.

use std::time::Duration;

use async_trait::async_trait;
use benchlib_core::error::{Error, Result};
use benchlib_core::session::PollSource;
use benchlib_core::transport::Transport;
use bytes::{BufMut, BytesMut};

use crate::rpc::{RpcClient, getport, put_opaque};

const DEVICE_CORE: u32 = 0x0607AF;
const DEVICE_CORE_VERSION: u32 = 1;

const CREATE_LINK: u32 = 10;
const DEVICE_WRITE: u32 = 11;
const DEVICE_READ: u32 = 12;
const DESTROY_LINK: u32 = 23;

/// `device_write` flag: this write ends the message.
const DF_END: u32 = 0x08;

/// `device_read` reason bits that end a reply. `RRR_SIZE` (0x01) only
/// means the requested count was filled.
const RRR_TERM: u32 = 0x02;
const RRR_END: u32 = 0x04;

/// VXI-11 error code for an I/O timeout.
const VXI_IO_TIMEOUT: u32 = 15;

/// Used when an instrument reports a max receive size of 0.
const DEFAULT_MAX_SEND: usize = 4096;

/// Slack added to `io_timeout` for the RPC round trip itself.
const RPC_MARGIN: Duration = Duration::from_secs(1);

/// VXI-11 link parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vxi11Config {
    /// Logical instrument name, e.g. `inst0` or `gpib0,5`.
    pub instrument: String,
    /// Portmapper TCP port.
    pub portmapper_port: u16,
    /// How long the instrument may take to complete one write or read.
    pub io_timeout: Duration,
    /// How long to wait for the device lock.
    pub lock_timeout: Duration,
}

impl Default for Vxi11Config {
    fn default() -> Self {
        Vxi11Config {
            instrument: "inst0".to_string(),
            portmapper_port: 111,
            io_timeout: Duration::from_millis(2000),
            lock_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug)]
struct Link {
    client: RpcClient,
    id: u32,
    max_send: usize,
}

/// VXI-11 transport.
#[derive(Debug)]
pub struct Vxi11Transport {
    host: String,
    config: Vxi11Config,
    link: Option<Link>,
    /// Reason bits of the most recent `device_read`.
    read_reason: u32,
}

impl Vxi11Transport {
    pub fn new(host: &str, config: Vxi11Config) -> Self {
        Vxi11Transport {
            host: host.to_string(),
            config,
            link: None,
            read_reason: 0,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn rpc_timeout(&self) -> Duration {
        self.config.io_timeout + RPC_MARGIN
    }
}

#[async_trait]
impl Transport for Vxi11Transport {
    async fn open(&mut self) -> Result<()> {
        let timeout = self.rpc_timeout();
        tracing::debug!(
            host = %self.host,
            instrument = %self.config.instrument,
            "Opening VXI-11 link"
        );

        let port = getport(
            &self.host,
            self.config.portmapper_port,
            DEVICE_CORE,
            DEVICE_CORE_VERSION,
            timeout,
        )
        .await
        .map_err(|e| {
            tracing::error!(host = %self.host, error = %e, "VXI-11 portmapper lookup failed");
            e
        })?;

        let mut client = RpcClient::connect(
            &format!("{}:{}", self.host, port),
            DEVICE_CORE,
            DEVICE_CORE_VERSION,
            timeout,
        )
        .await?;

        let mut args = BytesMut::new();
        args.put_u32(std::process::id());
        args.put_u32(0); // lockDevice = false
        args.put_u32(self.config.lock_timeout.as_millis() as u32);
        put_opaque(&mut args, self.config.instrument.as_bytes());

        let mut reply = client.call(CREATE_LINK, &args, timeout).await?;
        let error = reply.u32()?;
        if error != 0 {
            tracing::error!(host = %self.host, error, "create_link refused");
            return Err(Error::Transport(format!(
                "VXI-11 create_link for {} failed with error {}",
                self.config.instrument, error
            )));
        }
        let id = reply.u32()?;
        let _abort_port = reply.u32()?;
        let max_recv = reply.u32()? as usize;
        let max_send = if max_recv == 0 { DEFAULT_MAX_SEND } else { max_recv };

        tracing::info!(
            host = %self.host,
            instrument = %self.config.instrument,
            link = id,
            max_send,
            "VXI-11 link established"
        );

        self.link = Some(Link {
            client,
            id,
            max_send,
        });
        self.read_reason = 0;
        Ok(())
    }

    fn terminator(&self) -> &'static str {
        "\r\n"
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        let timeout = self.rpc_timeout();
        let io_timeout = self.config.io_timeout.as_millis() as u32;
        let lock_timeout = self.config.lock_timeout.as_millis() as u32;
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;

        let line = format!("{command}\r\n");
        let chunk = &line.as_bytes()[..line.len().min(link.max_send)];

        tracing::trace!(host = %self.host, command = %command, "Sending command");

        let mut args = BytesMut::new();
        args.put_u32(link.id);
        args.put_u32(io_timeout);
        args.put_u32(lock_timeout);
        args.put_u32(DF_END);
        put_opaque(&mut args, chunk);

        let mut reply = link.client.call(DEVICE_WRITE, &args, timeout).await?;
        let error = reply.u32()?;
        if error != 0 {
            return Err(Error::Transport(format!("VXI-11 device_write failed with error {error}")));
        }
        let written = reply.u32()? as usize;

        if written < line.len() {
            tracing::debug!(
                host = %self.host,
                written,
                expected = line.len(),
                "Short VXI-11 write"
            );
        }

        Ok(written)
    }

    async fn read_begin(&mut self) -> Result<()> {
        self.read_reason = 0;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.rpc_timeout();
        let io_timeout = self.config.io_timeout.as_millis() as u32;
        let lock_timeout = self.config.lock_timeout.as_millis() as u32;
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;

        let mut args = BytesMut::new();
        args.put_u32(link.id);
        args.put_u32(buf.len() as u32);
        args.put_u32(io_timeout);
        args.put_u32(lock_timeout);
        args.put_u32(0); // flags
        args.put_u32(0); // termChar

        let mut reply = link.client.call(DEVICE_READ, &args, timeout).await?;
        let error = reply.u32()?;
        match error {
            0 => {}
            VXI_IO_TIMEOUT => return Ok(0),
            _ => {
                return Err(Error::Transport(format!("VXI-11 device_read failed with error {error}")));
            }
        }
        let reason = reply.u32()?;
        let data = reply.opaque()?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.read_reason = reason;

        tracing::trace!(host = %self.host, bytes = n, reason, "Received data");
        Ok(n)
    }

    fn read_complete(&self) -> bool {
        self.read_reason & (RRR_TERM | RRR_END) != 0
    }

    /// The link has no pollable descriptor, so it is driven by a pure timer.
    fn poll_source(&self, timeout: Duration) -> PollSource {
        PollSource::timer(timeout)
    }

    async fn close(&mut self) -> Result<()> {
        let timeout = self.rpc_timeout();
        if let Some(mut link) = self.link.take() {
            tracing::debug!(host = %self.host, link = link.id, "Destroying VXI-11 link");

            let mut args = BytesMut::new();
            args.put_u32(link.id);
            match link.client.call(DESTROY_LINK, &args, timeout).await {
                Ok(mut reply) => {
                    let error = reply.u32()?;
                    if error != 0 {
                        tracing::warn!(host = %self.host, error, "destroy_link reported an error");
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %self.host, error = %e, "destroy_link failed (continuing anyway)");
                }
            }

            tracing::info!(host = %self.host, "VXI-11 link closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn description(&self) -> String {
        format!("vxi/{}/{}", self.host, self.config.instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{XdrReader, read_record};
    use benchlib_core::session::PollEvents;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Reason bit set on every chunk that filled the requested count.
    const RRR_SIZE: u32 = 0x01;

    /// Decoded call: procedure number and an argument reader.
    async fn next_call(stream: &mut TcpStream) -> Option<(u32, u32, XdrReader)> {
        let record = read_record(stream).await.ok()?;
        let mut reader = XdrReader::new(record);
        let xid = reader.u32().unwrap();
        let _msg = reader.u32().unwrap();
        let _rpcvers = reader.u32().unwrap();
        let _prog = reader.u32().unwrap();
        let _vers = reader.u32().unwrap();
        let procedure = reader.u32().unwrap();
        let _cred = (reader.u32().unwrap(), reader.opaque().unwrap());
        let _verf = (reader.u32().unwrap(), reader.opaque().unwrap());
        Some((xid, procedure, reader))
    }

    async fn reply(stream: &mut TcpStream, xid: u32, results: &[u8]) {
        let mut body = BytesMut::new();
        body.put_u32(xid);
        body.put_u32(1); // REPLY
        body.put_u32(0); // MSG_ACCEPTED
        body.put_u32(0);
        body.put_u32(0);
        body.put_u32(0); // SUCCESS
        body.put_slice(results);
        let mut record = BytesMut::new();
        record.put_u32(0x8000_0000 | body.len() as u32);
        record.extend_from_slice(&body);
        stream.write_all(&record).await.unwrap();
    }

    /// Fake portmapper + instrument. Replies to `*IDN?` with a fixed
    /// identity and to `:LONG?` with 300 bytes, and records every written
    /// command. Chunks that fill the requested count carry `RRR_SIZE`.
    async fn fake_instrument() -> (u16, tokio::task::JoinHandle<Vec<Bytes>>) {
        let portmapper = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let core = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pm_port = portmapper.local_addr().unwrap().port();
        let core_port = core.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut pm, _) = portmapper.accept().await.unwrap();
            let (xid, procedure, mut args) = next_call(&mut pm).await.unwrap();
            assert_eq!(procedure, 3);
            assert_eq!(args.u32().unwrap(), DEVICE_CORE);
            reply(&mut pm, xid, &(core_port as u32).to_be_bytes()).await;

            let (mut stream, _) = core.accept().await.unwrap();
            let mut written = Vec::new();
            let mut pending: Vec<u8> = Vec::new();
            while let Some((xid, procedure, mut args)) = next_call(&mut stream).await {
                let mut out = BytesMut::new();
                match procedure {
                    CREATE_LINK => {
                        let _client = args.u32().unwrap();
                        let _lock = args.u32().unwrap();
                        let _lock_timeout = args.u32().unwrap();
                        assert_eq!(&args.opaque().unwrap()[..], b"inst0");
                        out.put_u32(0);
                        out.put_u32(42);
                        out.put_u32(0);
                        out.put_u32(0); // max recv 0 -> client default
                    }
                    DEVICE_WRITE => {
                        assert_eq!(args.u32().unwrap(), 42);
                        let _io = args.u32().unwrap();
                        let _lock = args.u32().unwrap();
                        assert_eq!(args.u32().unwrap(), DF_END);
                        let data = args.opaque().unwrap();
                        match &data[..] {
                            b"*IDN?\r\n" => {
                                pending = b"RIGOL TECHNOLOGIES,DS2072,DS2A0001,00.01.01\n".to_vec();
                            }
                            b":LONG?\r\n" => {
                                pending = vec![b'A'; 299];
                                pending.push(b'\n');
                            }
                            _ => {}
                        }
                        out.put_u32(0);
                        out.put_u32(data.len() as u32);
                        written.push(data);
                    }
                    DEVICE_READ => {
                        assert_eq!(args.u32().unwrap(), 42);
                        let request = args.u32().unwrap() as usize;
                        if pending.is_empty() {
                            out.put_u32(VXI_IO_TIMEOUT);
                            out.put_u32(0);
                            put_opaque(&mut out, &[]);
                        } else {
                            let n = request.min(pending.len());
                            let chunk: Vec<u8> = pending.drain(..n).collect();
                            out.put_u32(0);
                            let reason = if pending.is_empty() {
                                RRR_END
                            } else if n == request {
                                RRR_SIZE
                            } else {
                                0
                            };
                            out.put_u32(reason);
                            put_opaque(&mut out, &chunk);
                        }
                    }
                    DESTROY_LINK => {
                        assert_eq!(args.u32().unwrap(), 42);
                        out.put_u32(0);
                        reply(&mut stream, xid, &out).await;
                        break;
                    }
                    other => panic!("unexpected procedure {other}"),
                }
                reply(&mut stream, xid, &out).await;
            }
            written
        });

        (pm_port, handle)
    }

    fn test_config(portmapper_port: u16) -> Vxi11Config {
        Vxi11Config {
            portmapper_port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn link_lifecycle_and_query() {
        let (pm_port, server) = fake_instrument().await;

        let mut transport = Vxi11Transport::new("127.0.0.1", test_config(pm_port));
        transport.open().await.unwrap();
        assert!(transport.is_connected());

        assert_eq!(transport.send("*IDN?").await.unwrap(), 7);
        let idn = transport.receive().await.unwrap();
        assert_eq!(idn, "RIGOL TECHNOLOGIES,DS2072,DS2A0001,00.01.01");
        assert!(transport.read_complete());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());

        let written = server.await.unwrap();
        assert_eq!(written, vec![Bytes::from_static(b"*IDN?\r\n")]);
    }

    #[tokio::test]
    async fn chunked_read_reports_completion_at_end() {
        let (pm_port, server) = fake_instrument().await;

        let mut transport = Vxi11Transport::new("127.0.0.1", test_config(pm_port));
        transport.open().await.unwrap();
        transport.send("*IDN?").await.unwrap();
        transport.read_begin().await.unwrap();

        let mut buf = [0u8; 8];
        let n = transport.read_data(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        // Only RRR_SIZE so far: more of the reply is pending.
        assert!(!transport.read_complete());

        let mut rest = Vec::new();
        let mut big = [0u8; 256];
        let n = transport.read_data(&mut big).await.unwrap();
        rest.extend_from_slice(&big[..n]);
        assert!(transport.read_complete());
        assert!(rest.ends_with(b"\n"));

        // Nothing pending: the instrument's I/O timeout maps to an empty read.
        transport.read_begin().await.unwrap();
        assert_eq!(transport.read_data(&mut big).await.unwrap(), 0);

        transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn long_reply_spans_full_chunks() {
        let (pm_port, server) = fake_instrument().await;

        let mut transport = Vxi11Transport::new("127.0.0.1", test_config(pm_port));
        transport.open().await.unwrap();

        transport.send(":LONG?").await.unwrap();
        let long = transport.receive().await.unwrap();
        assert_eq!(long.len(), 299);
        assert!(long.bytes().all(|b| b == b'A'));

        // The next query gets its own answer, not the tail of the last one.
        transport.send("*IDN?").await.unwrap();
        let idn = transport.receive().await.unwrap();
        assert_eq!(idn, "RIGOL TECHNOLOGIES,DS2072,DS2A0001,00.01.01");

        transport.close().await.unwrap();
        let written = server.await.unwrap();
        assert_eq!(
            written,
            vec![Bytes::from_static(b":LONG?\r\n"), Bytes::from_static(b"*IDN?\r\n")]
        );
    }

    #[tokio::test]
    async fn portmapper_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = Vxi11Transport::new("127.0.0.1", test_config(port));
        assert!(matches!(transport.open().await, Err(Error::Transport(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn io_before_open_returns_not_connected() {
        let mut transport = Vxi11Transport::new("10.0.0.9", Vxi11Config::default());
        assert!(matches!(transport.send("*RST").await, Err(Error::NotConnected)));
        let mut buf = [0u8; 4];
        assert!(matches!(transport.read_data(&mut buf).await, Err(Error::NotConnected)));
        // Closing an unopened link is a no-op.
        transport.close().await.unwrap();
    }

    #[test]
    fn poll_source_is_a_timer() {
        let transport = Vxi11Transport::new("10.0.0.9", Vxi11Config::default());
        let source = transport.poll_source(Duration::from_millis(50));
        assert_eq!(source.events, PollEvents::None);
        assert_eq!(transport.description(), "vxi/10.0.0.9/inst0");
        assert_eq!(transport.terminator(), "\r\n");
    }
}
