//! DNS carrier: the query/answer plumbing on both ends of the tunnel.
//!
//! Payload and ACK ride on TCP DNS (RFC 1035 two-byte length framing, one
//! connection per query): the receiver's answer is synchronous protocol
//! state, so a stream transport that pairs each answer with its query is the
//! natural fit and the 512-byte UDP ceiling never comes into play.

use crate::dns::{read_frame, write_frame, DnsMessage};
use crate::error::{Result, TunnelError};
use crate::receiver::TunnelServer;
use async_trait::async_trait;
use log::{debug, error, info};
use rand::Rng;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// One round trip on the tunnel: a QNAME out, an IPv4 answer back.
///
/// The sender's reliability layer talks to the network only through this
/// trait; tests substitute scripted implementations to inject loss,
/// duplication and tampering deterministically.
#[async_trait]
pub trait Carrier: Send + Sync {
    async fn query(&self, qname: &str) -> Result<Ipv4Addr>;
}

/// TCP DNS client used by the agent.
#[derive(Debug, Clone)]
pub struct DnsCarrier {
    server: SocketAddr,
    timeout: Duration,
}

impl DnsCarrier {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn exchange(&self, qname: &str, id: u16) -> Result<Ipv4Addr> {
        let mut stream = TcpStream::connect(self.server).await?;

        let query = DnsMessage::new_query(qname, id);
        write_frame(&mut stream, &query.to_bytes()).await?;

        let raw = read_frame(&mut stream).await?;
        let answer = DnsMessage::parse(&raw)?;

        if answer.header.id != id {
            return Err(TunnelError::Format(format!(
                "transaction id mismatch: sent {:04x}, got {:04x}",
                id, answer.header.id
            )));
        }
        answer
            .first_a_answer()
            .ok_or_else(|| TunnelError::Format("answer carries no A record".into()))
    }
}

#[async_trait]
impl Carrier for DnsCarrier {
    /// Issue one A query and return the answer address, or `Timeout` when
    /// the deadline passes. Network errors surface as-is; the reliability
    /// layer treats both the same way it treats silent loss.
    async fn query(&self, qname: &str) -> Result<Ipv4Addr> {
        let id: u16 = rand::thread_rng().gen();
        debug!("query {:04x} -> {} ({})", id, self.server, qname);

        match tokio::time::timeout(self.timeout, self.exchange(qname, id)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout),
        }
    }
}

/// TCP DNS listener wrapping the receiver's reliability layer.
pub struct TunnelListener {
    listener: TcpListener,
}

impl TunnelListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Actual bound address, for callers that bind port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each connection is served on its own task; a bad client
    /// never takes the listener down.
    pub async fn serve(self, server: Arc<TunnelServer>) -> Result<()> {
        info!(
            "DNS tunnel server listening on {} for {}",
            self.listener.local_addr()?,
            server.codec().domain()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, server).await {
                            debug!("connection from {} ended: {}", peer, err);
                        }
                    });
                }
                Err(err) => {
                    error!("accept failed: {}", err);
                }
            }
        }
    }
}

/// Serve one TCP connection until the client closes it. Tunnel-domain
/// queries go through the reliability layer; everything else is NXDOMAIN.
async fn serve_connection(mut stream: TcpStream, server: Arc<TunnelServer>) -> Result<()> {
    loop {
        let raw = match read_frame(&mut stream).await {
            Ok(raw) => raw,
            Err(TunnelError::Io(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let query = DnsMessage::parse(&raw)?;
        let id = query.header.id;
        let qname = query.question_name()?.to_string();

        let reply = if server.codec().matches(&qname) {
            let ack = server.handle_query(&qname).await;
            DnsMessage::new_answer(&qname, ack, id)
        } else {
            debug!("non-tunnel query {:?} answered NXDOMAIN", qname);
            DnsMessage::new_nxdomain(&qname, id)
        };

        write_frame(&mut stream, &reply.to_bytes()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KEY_LEN;
    use crate::codec::RESET_ACK;
    use crate::config::TunnelConfig;

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            key: "00".repeat(KEY_LEN),
            ..TunnelConfig::default()
        }
    }

    async fn spawn_server() -> (DnsCarrier, tokio::task::JoinHandle<Result<()>>) {
        let server = Arc::new(TunnelServer::new(&test_config()).unwrap());
        let listener = TunnelListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(listener.serve(server));
        (DnsCarrier::new(addr, Duration::from_secs(2)), handle)
    }

    #[tokio::test]
    async fn reset_query_is_answered_over_tcp() {
        let (carrier, handle) = spawn_server().await;

        let answer = carrier.query("seq-1.tunnel.example.com").await.unwrap();
        assert_eq!(answer, RESET_ACK);

        handle.abort();
    }

    #[tokio::test]
    async fn non_tunnel_query_gets_no_answer_record() {
        let (carrier, handle) = spawn_server().await;

        let result = carrier.query("www.example.org").await;
        assert!(matches!(result, Err(TunnelError::Format(_))));

        handle.abort();
    }

    #[tokio::test]
    async fn unreachable_server_times_out_or_errors() {
        // Port 1 on loopback: either refused instantly or never answered.
        let carrier = DnsCarrier::new(
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(200),
        );
        assert!(carrier.query("seq-1.tunnel.example.com").await.is_err());
    }
}
