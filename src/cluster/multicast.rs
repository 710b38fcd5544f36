//! UDP multicast discovery for local networks

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::discovery::{Announcement, Discovery, ANNOUNCEMENT_BUFFER};

/// Administratively scoped group used for announcements
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 236);

const MAX_DATAGRAM: usize = 2048;

pub struct MulticastDiscovery {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    tx: broadcast::Sender<Announcement>,
    recv_task: JoinHandle<()>,
}

impl MulticastDiscovery {
    /// Join the multicast group on `port` and start listening
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(port: u16) -> anyhow::Result<Self> {
        let socket = Self::open_socket(port)?;
        let socket = Arc::new(socket);
        let (tx, _) = broadcast::channel(ANNOUNCEMENT_BUFFER);

        let recv_task = tokio::spawn(Self::recv_loop(socket.clone(), tx.clone()));
        info!("[DISCOVERY] Listening on {}:{}", MULTICAST_GROUP, port);

        Ok(Self {
            socket,
            target: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, port)),
            tx,
            recv_task,
        })
    }

    fn open_socket(port: u16) -> anyhow::Result<UdpSocket> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        // Several instances on one host share the port
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        if let Err(err) = socket.set_reuse_port(true) {
            debug!("[DISCOVERY] set_reuse_port failed: {:?}", err);
        }
        socket.set_multicast_loop_v4(true)?;
        socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn recv_loop(socket: Arc<UdpSocket>, tx: broadcast::Sender<Announcement>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("[DISCOVERY] Receive failed: {}", e);
                    continue;
                }
            };

            match Announcement::decode(&buf[..len]) {
                Ok(mut ann) => {
                    if ann.host.is_none() {
                        ann.host = Some(from.ip().to_string());
                    }
                    let _ = tx.send(ann);
                }
                Err(e) => debug!("[DISCOVERY] Ignoring datagram from {}: {}", from, e),
            }
        }
    }
}

impl Drop for MulticastDiscovery {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[async_trait]
impl Discovery for MulticastDiscovery {
    async fn announce(&self, announcement: &Announcement) -> anyhow::Result<()> {
        let bytes = announcement.encode()?;
        self.socket.send_to(&bytes, self.target).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.tx.subscribe()
    }
}
