//! TCP connect probe
//!
//! A fetch opens a non-blocking TCP connection to the URL's host and port
//! and succeeds once the connection is established. Target addresses are
//! resolved once, when the transport is built.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use super::{Completion, Transport};
use crate::config::UrlConfig;
use crate::utils::TransportError;

pub struct TcpProbeTransport {
    targets: Vec<SocketAddr>,
    conns: Vec<Option<TcpStream>>,
    registry: Option<Registry>,
    in_flight: usize,
}

impl TcpProbeTransport {
    pub fn new(urls: &[UrlConfig], clients: usize) -> Result<Self, TransportError> {
        let targets = urls
            .iter()
            .map(|u| resolve(&u.url))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            targets,
            conns: (0..clients).map(|_| None).collect(),
            registry: None,
            in_flight: 0,
        })
    }

    pub fn target(&self, url: usize) -> Option<SocketAddr> {
        self.targets.get(url).copied()
    }

    fn finish(&mut self, client: usize) -> Option<TcpStream> {
        let mut stream = self.conns.get_mut(client)?.take()?;
        self.in_flight -= 1;
        if let Some(ref registry) = self.registry {
            if let Err(e) = registry.deregister(&mut stream) {
                debug!("Deregister of client {} failed: {}", client, e);
            }
        }
        Some(stream)
    }
}

impl Transport for TcpProbeTransport {
    fn begin_fetch(&mut self, client: usize, url: usize, _now: u64) -> Result<(), TransportError> {
        let registry = self.registry.as_ref().ok_or(TransportError::Unregistered)?;
        let addr = *self
            .targets
            .get(url)
            .ok_or_else(|| TransportError::BadUrl(format!("index {}", url)))?;
        let slot = self
            .conns
            .get_mut(client)
            .ok_or(TransportError::Busy(client))?;
        if slot.is_some() {
            return Err(TransportError::Busy(client));
        }

        let mut stream = TcpStream::connect(addr)?;
        registry.register(&mut stream, Token(client), Interest::WRITABLE)?;
        *slot = Some(stream);
        self.in_flight += 1;
        Ok(())
    }

    fn cancel_fetch(&mut self, client: usize) {
        self.finish(client);
    }

    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.registry = Some(registry.try_clone()?);
        Ok(())
    }

    fn on_event(&mut self, event: &Event, _now: u64, out: &mut Vec<Completion>) {
        let client = event.token().0;
        let Some(Some(stream)) = self.conns.get(client) else {
            return;
        };

        let connected = if event.is_error() {
            Some(false)
        } else if event.is_writable() {
            match stream.take_error() {
                Ok(Some(_)) | Err(_) => Some(false),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Some(true),
                    // Spurious wakeup, still connecting
                    Err(e) if e.kind() == ErrorKind::NotConnected => None,
                    Err(_) => Some(false),
                },
            }
        } else {
            None
        };

        if let Some(ok) = connected {
            self.finish(client);
            out.push(if ok {
                Completion::success(client)
            } else {
                Completion::failure(client)
            });
        }
    }

    fn perform(&mut self, _now: u64, _out: &mut Vec<Completion>) {}

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// Resolve `scheme://host[:port]/...` (or bare `host:port`) to an address
pub fn resolve(url: &str) -> Result<SocketAddr, TransportError> {
    let (host, port) = parse_authority(url)?;
    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(url.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Resolve(url.to_string()))
}

fn parse_authority(url: &str) -> Result<(String, u16), TransportError> {
    let bad = || TransportError::BadUrl(url.to_string());

    let (default_port, rest) = match url.split_once("://") {
        Some((scheme, rest)) => {
            let port = match scheme.to_ascii_lowercase().as_str() {
                "http" => 80,
                "https" => 443,
                "ftp" => 21,
                "ftps" => 990,
                _ => return Err(bad()),
            };
            (Some(port), rest)
        }
        None => (None, url),
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    // Drop credentials
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        return Err(bad());
    }

    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, after) = v6.split_once(']').ok_or_else(bad)?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| bad())?,
        None => default_port.ok_or_else(bad)?,
    };
    if host.is_empty() {
        return Err(bad());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("http://example.com/index.html").unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            parse_authority("https://user:pw@example.com:8443/x?y").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("ftp://[::1]/pub").unwrap(),
            ("::1".to_string(), 21)
        );
        assert_eq!(
            parse_authority("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert!(parse_authority("gopher://x/").is_err());
        assert!(parse_authority("127.0.0.1").is_err());
        assert!(parse_authority("http:///path").is_err());
        assert!(parse_authority("http://host:notaport/").is_err());
    }

    #[test]
    fn test_begin_requires_registry() {
        let urls = vec![UrlConfig::new("http://127.0.0.1:1/")];
        let mut t = TcpProbeTransport::new(&urls, 1).unwrap();
        assert!(matches!(
            t.begin_fetch(0, 0, 0),
            Err(TransportError::Unregistered)
        ));
    }

    #[test]
    fn test_connect_to_listener_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let mut t = TcpProbeTransport::new(&[UrlConfig::new(url)], 2).unwrap();

        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(16);
        t.register(poll.registry()).unwrap();
        t.begin_fetch(1, 0, 0).unwrap();
        assert_eq!(t.in_flight(), 1);

        let mut out = Vec::new();
        for _ in 0..50 {
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
            for event in events.iter() {
                t.on_event(event, 0, &mut out);
            }
            if !out.is_empty() {
                break;
            }
        }
        assert_eq!(out, vec![Completion::success(1)]);
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_cancel_releases_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let mut t = TcpProbeTransport::new(&[UrlConfig::new(url)], 1).unwrap();
        let poll = Poll::new().unwrap();
        t.register(poll.registry()).unwrap();

        t.begin_fetch(0, 0, 0).unwrap();
        t.cancel_fetch(0);
        assert_eq!(t.in_flight(), 0);
        // Slot is free again
        t.begin_fetch(0, 0, 0).unwrap();
    }
}
