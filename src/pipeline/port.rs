//! Port allocation: find the first bindable port at or above a start port.
//!
//! The probe binds a listener on both loopback addresses and drops it
//! immediately, so the port is free at the moment of return. Both families
//! are checked because the server is reached as `localhost`, which may
//! resolve to `::1`. A host without IPv6 only needs the IPv4 bind.
//!
//! Another process can still grab the port before the content server binds;
//! the readiness poll in [`super::server`] surfaces that as a startup failure.

use crate::error::MarkPdfError;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};
use tracing::debug;

/// Return the first port `>= start` that can be bound, probing at most
/// `max_probes` consecutive ports.
pub fn find_available_port(start: u16, max_probes: u16) -> Result<u16, MarkPdfError> {
    let mut port = start;
    for attempt in 0..max_probes {
        match probe(port) {
            Ok(()) => {
                debug!(port, attempts = attempt + 1, "Found free port");
                return Ok(port);
            }
            Err(e) => {
                debug!(port, "Port unavailable: {}", e);
            }
        }
        port = match port.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    Err(MarkPdfError::PortRangeExhausted {
        start,
        attempts: max_probes,
    })
}

/// Bind `port` on 127.0.0.1 and on ::1 where IPv6 exists.
fn probe(port: u16) -> io::Result<()> {
    let v4 = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    let v6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, port)) {
        Ok(listener) => Some(listener),
        Err(e) if ipv6_unavailable(&e) => None,
        Err(e) => return Err(e),
    };
    drop((v4, v6));
    Ok(())
}

fn ipv6_unavailable(e: &io::Error) -> bool {
    if matches!(e.kind(), ErrorKind::AddrNotAvailable | ErrorKind::Unsupported) {
        return true;
    }
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::EAFNOSUPPORT) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_a_bound_port() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = held.local_addr().unwrap().port();

        let port = find_available_port(taken, 50).expect("a later port should be free");
        assert!(port > taken, "expected a port above {taken}, got {port}");
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("returned port must be bindable");
    }

    #[test]
    fn returns_start_when_free() {
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let free = probe.local_addr().unwrap().port();
        drop(probe);

        assert_eq!(find_available_port(free, 1).unwrap(), free);
    }

    #[test]
    fn single_probe_on_bound_port_is_exhausted() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = held.local_addr().unwrap().port();

        let err = find_available_port(taken, 1).unwrap_err();
        assert!(matches!(err, MarkPdfError::PortRangeExhausted { attempts: 1, .. }));
    }

    #[test]
    fn skips_a_port_taken_only_on_ipv6_loopback() {
        let Ok(held) = TcpListener::bind((Ipv6Addr::LOCALHOST, 0)) else {
            return; // no IPv6 loopback here
        };
        let taken = held.local_addr().unwrap().port();
        if TcpListener::bind((Ipv4Addr::LOCALHOST, taken)).is_err() {
            return; // dual-stack socket also holds the IPv4 side
        }

        let port = find_available_port(taken, 50).expect("a later port should be free");
        assert!(port > taken, "::1:{taken} is in use but was returned");
    }

    #[test]
    fn stops_at_the_top_of_the_port_range() {
        // Held by us or by someone else: either way 65535 is unavailable and
        // there is no higher port to move on to.
        let _held = TcpListener::bind((Ipv4Addr::LOCALHOST, u16::MAX));

        let err = find_available_port(u16::MAX, 10).unwrap_err();
        assert!(matches!(
            err,
            MarkPdfError::PortRangeExhausted { start: u16::MAX, .. }
        ));
    }
}
