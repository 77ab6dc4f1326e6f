//! Local TCP port probing.
//!
//! One bind attempt on the wildcard address is the whole oracle: if the
//! bind succeeds the port is free (the probe listener is dropped right
//! away), any error means not free. The answer is advisory: the port can
//! be taken between the probe and whatever binds next. Callers must treat
//! the real bind by the tunnel process as the authoritative check.

use std::net::TcpListener;

/// How many consecutive ports `first_free_port` scans before giving up.
const SCAN_LIMIT: u16 = 128;

/// Returns true if a listener can currently be bound on `0.0.0.0:port`.
///
/// No retries; a single bind attempt is authoritative at the instant of
/// the call.
#[must_use]
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Finds the first free port at or above `start`, scanning upward.
///
/// Returns `None` if nothing frees up within the scan window (or the port
/// range runs out). Used to prefill local port suggestions; the result is
/// as advisory as [`is_port_free`].
#[must_use]
pub fn first_free_port(start: u16) -> Option<u16> {
    (0..SCAN_LIMIT)
        .map_while(|offset| start.checked_add(offset))
        .find(|port| is_port_free(*port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_port_reports_busy_until_released() {
        // Bind on an ephemeral port so the test owns it exclusively.
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_free(port));
        drop(listener);
        assert!(is_port_free(port));
    }

    #[test]
    fn scan_skips_a_held_port() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let suggested = first_free_port(port).unwrap();
        assert_ne!(suggested, port);
        assert!(suggested > port);
    }

    #[test]
    fn scan_stops_at_the_end_of_the_port_range() {
        // Nothing above u16::MAX to scan into; either the port itself is
        // free or the scan must return None rather than wrap.
        let result = first_free_port(u16::MAX);
        if let Some(port) = result {
            assert_eq!(port, u16::MAX);
        }
    }
}
