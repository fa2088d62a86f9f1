//! Lock-step byte exchange between round participants, and the TCP topology that connects
//! them.
//!
//! Every message in a round has a length both ends already know, so streams carry raw buffers
//! with no framing. Within one exchange, reads from distinct streams run concurrently and are
//! XORed together once all of them have arrived.
//!
//! ```text
//!   clients ──► server 0 ◄──► server 1 ◄── clients
//!                   ▲            ▲
//!                   └─► server 2 ◄┘
//! ```
//!
//! Each client dials `client_port + (client_id mod servers)`. Server `i` dials every server
//! with a lower id at `server_port + j`, announces its id, and accepts every server with a
//! higher id, so each edge of the mesh is dialed exactly once.

use std::io;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::cipher::xor_bytes;
use crate::config::DcNetConfig;
use crate::error::{DcNetError, Result};

/// A connection to another server of the mesh.
#[derive(Debug)]
pub struct PeerLink<S> {
    pub id: usize,
    pub stream: S,
}

impl<S> PeerLink<S> {
    /// Wraps `stream`, already connected to server `id`.
    pub fn new(id: usize, stream: S) -> Self {
        PeerLink { id, stream }
    }
}

/// Writes `buffer` and flushes it.
pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, buffer: &[u8]) -> io::Result<()> {
    stream.write_all(buffer).await?;
    stream.flush().await
}

/// Reads exactly `buffer.len()` bytes into `buffer`.
pub async fn receive<S: AsyncRead + Unpin>(stream: &mut S, buffer: &mut [u8]) -> io::Result<()> {
    stream.read_exact(buffer).await.map(|_| ())
}

/// Reads one `acc.len()` buffer from every stream and XORs each into `acc`.
pub async fn gather<S: AsyncRead + Unpin>(streams: &mut [S], acc: &mut [u8]) -> io::Result<()> {
    let len = acc.len();
    let reads = streams.iter_mut().map(|stream| async move {
        let mut buffer = vec![0u8; len];
        receive(stream, &mut buffer).await?;
        Ok::<_, io::Error>(buffer)
    });

    for buffer in try_join_all(reads).await? {
        xor_bytes(&buffer, acc);
    }
    Ok(())
}

/// Writes `buffer` to every stream.
pub async fn broadcast<S: AsyncWrite + Unpin>(streams: &mut [S], buffer: &[u8]) -> io::Result<()> {
    try_join_all(streams.iter_mut().map(|stream| send(stream, buffer))).await?;
    Ok(())
}

/// Swaps aggregates with every peer and XORs theirs into `acc`.
///
/// `local` is this server's own aggregate, which is what every peer receives. Peers are
/// visited in ascending id order; toward a higher id this server writes first, toward a
/// lower id it reads first, so no two servers ever wait on each other.
pub async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    local_id: usize,
    peers: &mut [PeerLink<S>],
    local: &[u8],
    acc: &mut [u8],
) -> io::Result<()> {
    let mut scratch = vec![0u8; local.len()];
    for peer in peers.iter_mut() {
        if local_id < peer.id {
            send(&mut peer.stream, local).await?;
            receive(&mut peer.stream, &mut scratch).await?;
        } else {
            receive(&mut peer.stream, &mut scratch).await?;
            send(&mut peer.stream, local).await?;
        }
        xor_bytes(&scratch, acc);
    }
    Ok(())
}

/// The server a client connects to.
pub fn server_for_client(client_id: usize, num_servers: usize) -> usize {
    client_id % num_servers
}

/// How many clients connect to server `server_id`: an even split, with the remainder going to
/// the lowest server ids.
///
/// # Examples
///
/// ```rust
/// use dcnet::transport::connecting_clients;
///
/// assert_eq!(connecting_clients(0, 7, 3), 3);
/// assert_eq!(connecting_clients(1, 7, 3), 2);
/// assert_eq!(connecting_clients(2, 7, 3), 2);
/// ```
pub fn connecting_clients(server_id: usize, num_clients: usize, num_servers: usize) -> usize {
    let remainder = num_clients % num_servers;
    num_clients / num_servers + usize::from(server_id < remainder)
}

/// Where the servers of a deployment live.
#[derive(Debug, Clone)]
pub struct Topology {
    pub hosts: Vec<String>,
    pub bind_address: String,
    pub client_port: u16,
    pub server_port: u16,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

/// A server's bound listening sockets.
pub struct ServerListeners {
    pub servers: TcpListener,
    pub clients: TcpListener,
}

/// Every connection a server takes part in for a round.
pub struct ServerLinks {
    /// Peer servers in ascending id order.
    pub peers: Vec<PeerLink<TcpStream>>,
    pub clients: Vec<TcpStream>,
}

impl Topology {
    pub fn from_config(config: &DcNetConfig) -> Self {
        Topology {
            hosts: config.dcnet.servers.clone(),
            bind_address: config.dcnet.bind_address.clone(),
            client_port: config.dcnet.client_port,
            server_port: config.dcnet.server_port,
            connect_attempts: config.dcnet.connect_attempts.max(1),
            connect_backoff: Duration::from_millis(config.dcnet.connect_backoff_ms),
        }
    }

    pub fn host(&self, server_id: usize) -> &str {
        self.hosts
            .get(server_id)
            .map(String::as_str)
            .unwrap_or("localhost")
    }

    pub fn client_port(&self, server_id: usize) -> Result<u16> {
        offset_port(self.client_port, server_id)
    }

    pub fn server_port(&self, server_id: usize) -> Result<u16> {
        offset_port(self.server_port, server_id)
    }

    /// Dials the server assigned to `client_id`.
    pub async fn connect_client(&self, client_id: usize, num_servers: usize) -> Result<TcpStream> {
        if num_servers == 0 {
            return Err(DcNetError::Configuration("no servers configured".to_string()));
        }
        let server = server_for_client(client_id, num_servers);
        let stream = self
            .dial(self.host(server), self.client_port(server)?)
            .await?;
        debug!("client {} connected to server {}", client_id, server);
        Ok(stream)
    }

    /// Binds the server and client listeners of `server_id`.
    pub async fn bind_server(&self, server_id: usize) -> Result<ServerListeners> {
        let servers =
            TcpListener::bind((self.bind_address.as_str(), self.server_port(server_id)?)).await?;
        let clients =
            TcpListener::bind((self.bind_address.as_str(), self.client_port(server_id)?)).await?;
        Ok(ServerListeners { servers, clients })
    }

    /// Builds the mesh around `server_id`, then waits for its share of the clients.
    ///
    /// # Arguments
    ///
    /// * `listeners` - This server's listeners, from [`Topology::bind_server`].
    /// * `server_id` - This server's id.
    /// * `num_servers` - Size of the mesh.
    /// * `num_clients` - Clients in the whole deployment; this server waits for
    ///   [`connecting_clients`] of them.
    ///
    /// # Returns
    ///
    /// The peer links in ascending id order and the client streams in accept order.
    /// `Handshake` when an accepted server announces an id that is not a higher, unseen id of
    /// the mesh.
    pub async fn connect_server(
        &self,
        listeners: &ServerListeners,
        server_id: usize,
        num_servers: usize,
        num_clients: usize,
    ) -> Result<ServerLinks> {
        if server_id >= num_servers {
            return Err(DcNetError::Configuration(format!(
                "server id {} outside a mesh of {} servers",
                server_id, num_servers
            )));
        }
        let mut peers = Vec::with_capacity(num_servers - 1);

        for peer_id in 0..server_id {
            let mut stream = self
                .dial(self.host(peer_id), self.server_port(peer_id)?)
                .await?;
            send(&mut stream, &(server_id as u32).to_be_bytes()).await?;
            peers.push(PeerLink::new(peer_id, stream));
        }

        for _ in server_id + 1..num_servers {
            let (mut stream, addr) = listeners.servers.accept().await?;
            stream.set_nodelay(true)?;
            let mut id = [0u8; 4];
            receive(&mut stream, &mut id).await?;
            let peer_id = u32::from_be_bytes(id) as usize;

            if peer_id <= server_id
                || peer_id >= num_servers
                || peers.iter().any(|p: &PeerLink<TcpStream>| p.id == peer_id)
            {
                return Err(DcNetError::Handshake(format!(
                    "server {} at {} announced unexpected id {}",
                    server_id, addr, peer_id
                )));
            }
            peers.push(PeerLink::new(peer_id, stream));
        }
        peers.sort_by_key(|peer| peer.id);
        debug!("All ({}) servers connected.", peers.len());

        let expected = connecting_clients(server_id, num_clients, num_servers);
        let mut clients = Vec::with_capacity(expected);
        while clients.len() < expected {
            let (stream, _) = listeners.clients.accept().await?;
            stream.set_nodelay(true)?;
            clients.push(stream);
            if clients.len() % 5 == 0 {
                debug!("{}/{} clients connected.", clients.len(), expected);
            }
        }
        debug!("All ({}) clients connected.", expected);

        Ok(ServerLinks { peers, clients })
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut attempt = 1;
        loop {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) if attempt < self.connect_attempts => {
                    debug!("dial {}:{} failed ({}), retrying", host, port, err);
                    attempt += 1;
                    tokio::time::sleep(self.connect_backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn offset_port(base: u16, id: usize) -> Result<u16> {
    u16::try_from(id)
        .ok()
        .and_then(|id| base.checked_add(id))
        .ok_or_else(|| DcNetError::Configuration(format!("port {} + {} out of range", base, id)))
}
