use crate::utils::error::{HolepunchError, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const SSDP_MULTICAST_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

/// Seconds devices may wait before answering.
const MX_SECONDS: u64 = 2;

pub fn search_request(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\r\n",
        SSDP_MULTICAST_ADDR, MX_SECONDS, search_target
    )
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Extracts the descriptor location from a search response for `search_target`.
pub fn parse_search_response(response: &str, search_target: &str) -> Option<Url> {
    let status_line = response.lines().next()?;
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        return None;
    }

    if let Some(st) = header(response, "ST") {
        if st != search_target {
            return None;
        }
    }

    let location = header(response, "LOCATION")?;
    Url::parse(location).ok()
}

/// Adds the location from one received datagram. Receive errors are logged and dropped so
/// a single failed read does not discard what was already collected.
fn record_response(
    received: std::io::Result<(usize, SocketAddr)>,
    buf: &[u8],
    search_target: &str,
    locations: &mut Vec<Url>,
) {
    let (len, from) = match received {
        Ok(received) => received,
        Err(e) => {
            // 例如 Windows 上 ICMP port unreachable 會回報 ConnectionReset
            tracing::debug!(error = %e, "SSDP receive failed, still listening");
            return;
        }
    };

    let response = String::from_utf8_lossy(&buf[..len]);
    match parse_search_response(&response, search_target) {
        Some(location) if !locations.contains(&location) => {
            tracing::debug!(%from, %location, "SSDP response");
            locations.push(location);
        }
        Some(_) => {}
        None => tracing::trace!(%from, "Ignoring SSDP response"),
    }
}

/// Multicasts one search and collects distinct descriptor locations until `window`
/// elapses.
pub async fn search(
    search_target: &str,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Url>> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    let request = search_request(search_target);

    // UDP 可能掉包，送兩次
    for _ in 0..2 {
        socket
            .send_to(request.as_bytes(), SocketAddr::V4(SSDP_MULTICAST_ADDR))
            .await?;
    }

    let deadline = tokio::time::Instant::now() + window;
    let mut locations: Vec<Url> = Vec::new();
    let mut buf = vec![0u8; 2048];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Err(HolepunchError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => break,
            received = socket.recv_from(&mut buf) => received,
        };
        record_response(received, &buf, search_target, &mut locations);
    }

    Ok(locations)
}
