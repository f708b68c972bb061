use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dns::DnsPacket;
use crate::pipeline::{PipelineHandle, Transport};

/// Largest datagram we accept.
const MAX_UDP_SIZE: usize = 65535;

/// UDP + TCP DNS listeners over one bind address, both feeding the
/// pipeline. Shutdown is broadcast-driven and idempotent.
pub struct DnsServer {
    bind: String,
    pipeline: PipelineHandle,
    shutdown: broadcast::Sender<()>,
}

impl DnsServer {
    pub fn new(bind: &str, pipeline: PipelineHandle) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            bind: bind.to_string(),
            pipeline,
            shutdown,
        }
    }

    /// Bind both sockets and spawn the accept loops. Bind failures are
    /// fatal and surface to the caller. Returns the bound address (TCP
    /// binds to the same port the UDP socket obtained).
    pub async fn start(&self) -> std::io::Result<std::net::SocketAddr> {
        let udp = Arc::new(UdpSocket::bind(&self.bind).await?);
        let local = udp.local_addr()?;
        let tcp = TcpListener::bind(local).await?;
        info!("dns listening on {} (udp+tcp)", local);

        tokio::spawn(udp_loop(
            udp,
            self.pipeline.clone(),
            self.shutdown.subscribe(),
        ));
        tokio::spawn(tcp_loop(
            tcp,
            self.pipeline.clone(),
            self.shutdown.subscribe(),
        ));
        Ok(local)
    }

    /// Stop the accept loops. Repeated calls are harmless.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    pipeline: PipelineHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_UDP_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("udp listener shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("udp recv error: {}", err);
                        continue;
                    }
                };
                let data = buf[..len].to_vec();
                let socket = socket.clone();
                let pipeline = pipeline.clone();

                tokio::spawn(async move {
                    let packet = match DnsPacket::parse(&data) {
                        Ok(packet) => packet,
                        Err(err) => {
                            debug!("dropping unparseable udp query from {}: {}", peer, err);
                            return;
                        }
                    };
                    let Some(reply) = pipeline.process(Transport::Udp, packet).await else {
                        return;
                    };
                    match reply.to_bytes() {
                        Ok(bytes) => {
                            if let Err(err) = socket.send_to(&bytes, peer).await {
                                error!("failed to send udp reply to {}: {}", peer, err);
                            }
                        }
                        Err(err) => error!("failed to serialise reply for {}: {}", peer, err),
                    }
                });
            }
        }
    }
}

async fn tcp_loop(
    listener: TcpListener,
    pipeline: PipelineHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("tcp listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("tcp accept error: {}", err);
                        continue;
                    }
                };
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_tcp_connection(stream, pipeline).await {
                        debug!("tcp connection from {} ended: {}", peer, err);
                    }
                });
            }
        }
    }
}

/// Serve length-prefixed queries sequentially until the peer hangs up.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    pipeline: PipelineHandle,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // clean EOF
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        let packet = match DnsPacket::parse(&data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping unparseable tcp query: {}", err);
                return Ok(());
            }
        };

        let Some(reply) = pipeline.process(Transport::Tcp, packet).await else {
            return Ok(());
        };
        let bytes = reply
            .to_bytes()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;

        stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
    }
}
