//! Connection strings.
//!
//! | Form                          | Transport                           |
//! |-------------------------------|-------------------------------------|
//! | `tcp-raw/<host>/<port>`       | [`TcpTransport`], raw               |
//! | `tcp-rigol/<host>/<port>`     | [`TcpTransport`], length-prefixed   |
//! | `<host>:<port>`               | [`TcpTransport`], raw               |
//! | `usbtmc/<device node>`        | [`UsbTmcTransport`]                 |
//! | `vxi/<host>[/<instrument>]`   | [`Vxi11Transport`]                  |
//! | `gpib/<board>/<pad>`          | `GpibTransport` (feature `gpib`)    |
//! | `gpib/<interface name>`       | `GpibTransport` (feature `gpib`)    |
//! | anything else                 | [`SerialTransport`] on that path    |
//!
//! Serial line settings come separately, as a serial comm string such as
//! `115200/8n1/flow=0` (see [`SerialConfig`]), attached with
//! [`ConnectionSpec::with_serialcomm`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use benchlib_core::error::{Error, Result};
use benchlib_core::transport::Transport;

use crate::gpib::GpibAddress;
use crate::serial::{SerialConfig, SerialTransport};
use crate::tcp::{TcpFraming, TcpTransport};
use crate::usbtmc::UsbTmcTransport;
use crate::vxi11::{Vxi11Config, Vxi11Transport};

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Serial { port: String, config: SerialConfig },
    Tcp { addr: String, framing: TcpFraming },
    UsbTmc(PathBuf),
    Vxi11 { host: String, instrument: String },
    Gpib(GpibAddress),
}

impl ConnectionSpec {
    /// Apply a serial comm string. Only valid for serial connections.
    pub fn with_serialcomm(self, comm: &str) -> Result<Self> {
        match self {
            ConnectionSpec::Serial { port, .. } => Ok(ConnectionSpec::Serial {
                port,
                config: comm.parse()?,
            }),
            other => Err(Error::InvalidArgument(format!(
                "serial comm given for non-serial connection {other}"
            ))),
        }
    }

    /// Build the transport without opening it.
    pub fn into_transport(&self) -> Result<Box<dyn Transport>> {
        let transport: Box<dyn Transport> = match self {
            ConnectionSpec::Serial { port, config } => Box::new(SerialTransport::new(port, config.clone())),
            ConnectionSpec::Tcp { addr, framing } => Box::new(TcpTransport::new(addr, *framing)),
            ConnectionSpec::UsbTmc(path) => Box::new(UsbTmcTransport::new(path)),
            ConnectionSpec::Vxi11 { host, instrument } => Box::new(Vxi11Transport::new(
                host,
                Vxi11Config {
                    instrument: instrument.clone(),
                    ..Default::default()
                },
            )),
            #[cfg(feature = "gpib")]
            ConnectionSpec::Gpib(address) => Box::new(crate::gpib::GpibTransport::new(address.clone())),
            #[cfg(not(feature = "gpib"))]
            ConnectionSpec::Gpib(_) => {
                return Err(Error::Unsupported(
                    "GPIB support not compiled in (enable the `gpib` feature)".into(),
                ));
            }
        };
        Ok(transport)
    }

    /// Build and open the transport.
    pub async fn open(&self) -> Result<Box<dyn Transport>> {
        let mut transport = self.into_transport()?;
        transport.open().await?;
        Ok(transport)
    }
}

fn host_port(rest: &str, conn: &str) -> Result<String> {
    let (host, port) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgument(format!("expected <host>/<port> in '{conn}'")))?;
    if host.is_empty() {
        return Err(Error::InvalidArgument(format!("missing host in '{conn}'")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid port '{port}' in '{conn}'")))?;
    Ok(format!("{host}:{port}"))
}

impl FromStr for ConnectionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty connection string".into()));
        }

        if let Some((scheme, rest)) = s.split_once('/') {
            match scheme {
                "tcp-raw" => {
                    return Ok(ConnectionSpec::Tcp {
                        addr: host_port(rest, s)?,
                        framing: TcpFraming::Raw,
                    });
                }
                "tcp-rigol" => {
                    return Ok(ConnectionSpec::Tcp {
                        addr: host_port(rest, s)?,
                        framing: TcpFraming::LengthPrefixed,
                    });
                }
                "usbtmc" if !rest.is_empty() => return Ok(ConnectionSpec::UsbTmc(PathBuf::from(rest))),
                "vxi" => {
                    let (host, instrument) = rest.split_once('/').unwrap_or((rest, "inst0"));
                    if host.is_empty() || instrument.is_empty() {
                        return Err(Error::InvalidArgument(format!("expected vxi/<host>[/<instrument>], got '{s}'")));
                    }
                    return Ok(ConnectionSpec::Vxi11 {
                        host: host.to_string(),
                        instrument: instrument.to_string(),
                    });
                }
                "gpib" => return Ok(ConnectionSpec::Gpib(rest.parse()?)),
                "usbtmc" => return Err(Error::InvalidArgument("missing USB-TMC device node".into())),
                _ => {}
            }
        }

        // Bare host:port, as long as it doesn't look like a path.
        if !s.contains('/') {
            if let Some((host, port)) = s.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    if !host.is_empty() {
                        return Ok(ConnectionSpec::Tcp {
                            addr: format!("{host}:{port}"),
                            framing: TcpFraming::Raw,
                        });
                    }
                }
            }
        }

        Ok(ConnectionSpec::Serial {
            port: s.to_string(),
            config: SerialConfig::default(),
        })
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSpec::Serial { port, .. } => f.write_str(port),
            ConnectionSpec::Tcp { addr, framing } => {
                let scheme = match framing {
                    TcpFraming::Raw => "tcp-raw",
                    TcpFraming::LengthPrefixed => "tcp-rigol",
                };
                match addr.rsplit_once(':') {
                    Some((host, port)) => write!(f, "{scheme}/{host}/{port}"),
                    None => write!(f, "{scheme}/{addr}"),
                }
            }
            ConnectionSpec::UsbTmc(path) => write!(f, "usbtmc/{}", path.display()),
            ConnectionSpec::Vxi11 { host, instrument } => write!(f, "vxi/{host}/{instrument}"),
            ConnectionSpec::Gpib(address) => write!(f, "gpib/{address}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::Parity;

    fn parse(s: &str) -> ConnectionSpec {
        s.parse().unwrap()
    }

    #[test]
    fn tcp_forms() {
        assert_eq!(
            parse("tcp-raw/192.168.1.20/5555"),
            ConnectionSpec::Tcp {
                addr: "192.168.1.20:5555".into(),
                framing: TcpFraming::Raw,
            }
        );
        assert_eq!(
            parse("tcp-rigol/scope.lan/5555"),
            ConnectionSpec::Tcp {
                addr: "scope.lan:5555".into(),
                framing: TcpFraming::LengthPrefixed,
            }
        );
        assert_eq!(
            parse("10.0.0.5:5025"),
            ConnectionSpec::Tcp {
                addr: "10.0.0.5:5025".into(),
                framing: TcpFraming::Raw,
            }
        );
    }

    #[test]
    fn tcp_bad_port() {
        assert!(matches!(
            "tcp-raw/host/notaport".parse::<ConnectionSpec>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            "tcp-raw/host".parse::<ConnectionSpec>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn usbtmc_keeps_absolute_path() {
        assert_eq!(
            parse("usbtmc//dev/usbtmc0"),
            ConnectionSpec::UsbTmc(PathBuf::from("/dev/usbtmc0"))
        );
        assert!("usbtmc/".parse::<ConnectionSpec>().is_err());
    }

    #[test]
    fn vxi_default_instrument() {
        assert_eq!(
            parse("vxi/10.0.0.9"),
            ConnectionSpec::Vxi11 {
                host: "10.0.0.9".into(),
                instrument: "inst0".into(),
            }
        );
        assert_eq!(
            parse("vxi/10.0.0.9/gpib0,7"),
            ConnectionSpec::Vxi11 {
                host: "10.0.0.9".into(),
                instrument: "gpib0,7".into(),
            }
        );
    }

    #[test]
    fn gpib_forms() {
        assert_eq!(parse("gpib/0/22"), ConnectionSpec::Gpib(GpibAddress::Board { board: 0, pad: 22 }));
        assert_eq!(parse("gpib/scope"), ConnectionSpec::Gpib(GpibAddress::Name("scope".into())));
    }

    #[test]
    fn serial_with_comm() {
        let spec = parse("/dev/ttyUSB0").with_serialcomm("115200/8e1").unwrap();
        let ConnectionSpec::Serial { port, config } = spec else {
            panic!("expected serial");
        };
        assert_eq!(port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.parity, Parity::Even);
    }

    #[test]
    fn serialcomm_rejected_for_network() {
        assert!(matches!(
            parse("vxi/host").with_serialcomm("9600/8n1"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn display_matches_input() {
        for s in ["tcp-raw/host/5555", "tcp-rigol/host/5555", "usbtmc//dev/usbtmc1", "vxi/h/inst0", "gpib/0/5"] {
            assert_eq!(parse(s).to_string(), s);
        }
    }

    #[test]
    fn description_names_framing() {
        let transport = parse("tcp-rigol/host/5555").into_transport().unwrap();
        assert_eq!(transport.description(), "tcp-rigol/host:5555");
        assert!(!transport.is_connected());
    }

    #[cfg(not(feature = "gpib"))]
    #[test]
    fn gpib_without_feature_is_unsupported() {
        assert!(matches!(
            parse("gpib/0/5").into_transport(),
            Err(Error::Unsupported(_))
        ));
    }
}
