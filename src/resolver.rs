use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::dns::{DnsPacket, rcode};
use crate::error::ResolveError;

const DOH_MIME: &str = "application/dns-message";

/// Forwarding resolver: optional DoH first, then a staggered fan-out over
/// the classic nameservers with first-success-wins ordering.
pub struct Resolver {
    http: reqwest::Client,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("vordr/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Ask each nameserver top-to-bottom, starting a new request every
    /// `interval_ms`, and return as early as possible. Fails only when no
    /// attempt produced a usable answer.
    pub async fn lookup(
        &self,
        net: &str,
        req: &DnsPacket,
        timeout_s: u64,
        interval_ms: u64,
        nameservers: &[String],
        doh_url: &str,
    ) -> Result<DnsPacket, ResolveError> {
        let qname = req
            .first_question()
            .map(|q| q.qname())
            .unwrap_or_default();

        debug!(
            "lookup {} on {}, timeout: {}s, interval: {}ms, nameservers: {:?}, doh: {}",
            qname,
            net,
            timeout_s,
            interval_ms,
            nameservers,
            !doh_url.is_empty()
        );

        if !doh_url.is_empty() {
            match self.doh_lookup(doh_url, timeout_s, req).await {
                Ok(answer) => return Ok(answer),
                Err(err) => {
                    debug!("DoH failed due to '{}', falling back to nameservers", err)
                }
            }
        }

        // "http" carries TCP wire framing.
        let client_net = if net == "http" { "tcp" } else { net };

        let data = req.to_bytes().map_err(|err| {
            error!("failed to pack query for {}: {}", qname, err);
            ResolveError {
                qname: qname.clone(),
                net: net.to_string(),
                nameservers: nameservers.to_vec(),
            }
        })?;

        let failure = || ResolveError {
            qname: qname.clone(),
            net: net.to_string(),
            nameservers: nameservers.to_vec(),
        };

        let (tx, mut rx) = mpsc::channel::<DnsPacket>(1);
        let mut in_flight = JoinSet::new();

        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.tick().await; // the first tick is immediate

        for nameserver in nameservers {
            let tx = tx.clone();
            let data = data.clone();
            let nameserver = nameserver.clone();
            let qname = qname.clone();
            let net = client_net.to_string();
            let query_id = req.header.id;

            in_flight.spawn(async move {
                let answer = match exchange(&net, &nameserver, &data, timeout_s).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        error!("{} socket error on {}: {}", qname, nameserver, err);
                        return;
                    }
                };
                if answer.header.id != query_id {
                    warn!("{} mismatched reply id from {}", qname, nameserver);
                    return;
                }
                if answer.header.rcode != rcode::NOERROR {
                    warn!("{} failed to get a valid answer on {}", qname, nameserver);
                    if answer.header.rcode == rcode::SERVFAIL {
                        return;
                    }
                } else {
                    debug!("{} resolved on {} ({})", qname, nameserver, net);
                }
                // First answer wins; later sends are dropped on the floor.
                let _ = tx.try_send(answer);
            });

            tokio::select! {
                Some(answer) = rx.recv() => return Ok(answer),
                _ = ticker.tick() => continue,
            }
        }
        drop(tx);

        // Every nameserver has been launched; wait for a success or for the
        // whole fan-out to drain.
        loop {
            tokio::select! {
                Some(answer) = rx.recv() => return Ok(answer),
                joined = in_flight.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        // A task may have parked its answer just before finishing.
        match rx.try_recv() {
            Ok(answer) => Ok(answer),
            Err(_) => Err(failure()),
        }
    }

    /// RFC 8484 client lookup: POST the wire-format query, demand HTTP 200
    /// and the DoH media type both ways.
    pub async fn doh_lookup(
        &self,
        url: &str,
        timeout_s: u64,
        req: &DnsPacket,
    ) -> Result<DnsPacket, ResolveError> {
        let qname = req
            .first_question()
            .map(|q| q.qname())
            .unwrap_or_default();
        let failure = || ResolveError {
            qname: qname.clone(),
            net: "https".to_string(),
            nameservers: vec![url.to_string()],
        };

        let data = req.to_bytes().map_err(|err| {
            error!("failed to pack DNS message to wire format: {}", err);
            failure()
        })?;

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, DOH_MIME)
            .timeout(Duration::from_secs(timeout_s))
            .body(data)
            .send()
            .await
            .map_err(|err| {
                error!("request to DoH server failed: {}", err);
                failure()
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(failure());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type != DOH_MIME {
            return Err(failure());
        }

        let body = response.bytes().await.map_err(|_| failure())?;
        DnsPacket::parse(&body).map_err(|err| {
            error!("failed to unpack message from response: {}", err);
            failure()
        })
    }
}

/// One wire exchange with a nameserver over the given transport.
async fn exchange(
    net: &str,
    server: &str,
    data: &[u8],
    timeout_s: u64,
) -> std::io::Result<DnsPacket> {
    let limit = Duration::from_secs(timeout_s);
    match net {
        "tcp" => timeout(limit, exchange_tcp(server, data))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tcp exchange"))?,
        _ => timeout(limit, exchange_udp(server, data))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "udp exchange"))?,
    }
}

async fn exchange_udp(server: &str, data: &[u8]) -> std::io::Result<DnsPacket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    socket.send(data).await?;

    let mut buf = vec![0u8; 4096];
    let len = socket.recv(&mut buf).await?;
    DnsPacket::parse(&buf[..len])
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
}

async fn exchange_tcp(server: &str, data: &[u8]) -> std::io::Result<DnsPacket> {
    let mut stream = TcpStream::connect(server).await?;

    stream.write_all(&(data.len() as u16).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    DnsPacket::parse(&buf)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
}
