//! Linux `NetworkObserver` adapter: infers the local interface used to
//! reach the server from the socket address the kernel would route
//! through, then names it via `sysinfo`.

use std::net::UdpSocket;

use nh_agent_core::error::{FlashError, FlashResult};
use nh_agent_core::hal::NetworkObserver;
use nh_agent_core::types::NetworkInterface;
use sysinfo::Networks;

pub struct SysinfoNetworkObserver;

impl SysinfoNetworkObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SysinfoNetworkObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NetworkObserver for SysinfoNetworkObserver {
    async fn current_interface(&self, server_host: &str) -> FlashResult<NetworkInterface> {
        let host = server_host.to_string();
        tokio::task::spawn_blocking(move || current_interface_blocking(&host))
            .await
            .map_err(|e| FlashError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

fn current_interface_blocking(server_host: &str) -> FlashResult<NetworkInterface> {
    // Connecting a UDP socket does no I/O; it just asks the kernel to pick
    // the route (and therefore local address) it would use for this peer.
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(FlashError::Io)?;
    socket
        .connect((server_host, 443))
        .map_err(FlashError::Io)?;
    let local_addr = socket.local_addr().map_err(FlashError::Io)?;
    let local_ip = local_addr.ip().to_string();

    let networks = Networks::new_with_refreshed_list();
    for (name, data) in &networks {
        if data.ip_networks().iter().any(|n| n.addr.to_string() == local_ip) {
            return Ok(NetworkInterface {
                name: name.clone(),
                address: local_ip,
            });
        }
    }

    Ok(NetworkInterface {
        name: "unknown".to_string(),
        address: local_ip,
    })
}
