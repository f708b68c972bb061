use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use vordr::dns::{DnsPacket, DnsResource};

/// A scripted upstream nameserver for integration tests.
pub struct FakeNameserver {
    pub addr: String,
    pub hits: Arc<AtomicUsize>,
}

impl FakeNameserver {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// UDP-only nameserver answering every A query with `answer`.
pub async fn udp_nameserver(answer: Ipv4Addr) -> FakeNameserver {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    let hits = Arc::new(AtomicUsize::new(0));
    let task_hits = hits.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(query) = DnsPacket::parse(&buf[..len]) else {
                continue;
            };
            task_hits.fetch_add(1, Ordering::SeqCst);

            let mut reply = DnsPacket::reply_to(&query);
            if let Some(question) = query.first_question() {
                reply
                    .answers
                    .push(DnsResource::new_a(&question.qname(), 60, answer));
            }
            reply.sync_counts();
            let _ = socket.send_to(&reply.to_bytes().unwrap(), peer).await;
        }
    });

    FakeNameserver { addr, hits }
}

/// Nameserver that truncates over UDP and answers properly over TCP, on
/// one shared port.
pub async fn truncating_nameserver(answer: Ipv4Addr) -> FakeNameserver {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = tcp.local_addr().unwrap();
    let udp = UdpSocket::bind(local).await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let udp_hits = hits.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                break;
            };
            let Ok(query) = DnsPacket::parse(&buf[..len]) else {
                continue;
            };
            udp_hits.fetch_add(1, Ordering::SeqCst);

            let mut reply = DnsPacket::reply_to(&query);
            reply.header.tc = true;
            reply.sync_counts();
            let _ = udp.send_to(&reply.to_bytes().unwrap(), peer).await;
        }
    });

    let tcp_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp.accept().await else {
                break;
            };
            let tcp_hits = tcp_hits.clone();
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let Ok(query) = DnsPacket::parse(&buf) else {
                    return;
                };
                tcp_hits.fetch_add(1, Ordering::SeqCst);

                let mut reply = DnsPacket::reply_to(&query);
                if let Some(question) = query.first_question() {
                    reply
                        .answers
                        .push(DnsResource::new_a(&question.qname(), 60, answer));
                }
                reply.sync_counts();
                let bytes = reply.to_bytes().unwrap();
                let _ = stream.write_all(&(bytes.len() as u16).to_be_bytes()).await;
                let _ = stream.write_all(&bytes).await;
            });
        }
    });

    FakeNameserver { addr: local.to_string(), hits }
}
