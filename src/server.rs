use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::DomainClassifier;
use crate::codec;
use crate::journal::{Journal, QueryRecord};
use crate::notify::{Notifier, QueryEvent};
use crate::upstream::{DnsResolver, QueryContext};

// Plain DNS over UDP ingress; larger datagrams are read truncated.
const MAX_DATAGRAM: usize = 512;
// Hard budget for one query from ingress to reply.
const HANDLER_BUDGET: Duration = Duration::from_secs(5);

pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub domestic: Arc<dyn DnsResolver>,
    pub overseas: Arc<dyn DnsResolver>,
    pub classifier: Arc<DomainClassifier>,
    pub journal: Arc<dyn Journal>,
    pub notifier: Notifier,
    pub shutdown: CancellationToken,
}

struct Shared {
    // read side belongs to the ingress loop, handlers only reply through it
    socket: UdpSocket,
    domestic: Arc<dyn DnsResolver>,
    overseas: Arc<dyn DnsResolver>,
    classifier: Arc<DomainClassifier>,
    journal: Arc<dyn Journal>,
    notifier: Notifier,
}

pub struct DnsServer {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl DnsServer {
    pub async fn bind(options: ServerOptions) -> anyhow::Result<Self> {
        let socket = bind_udp(options.bind_addr)?;
        info!(
            bind = %options.bind_addr,
            domestic = options.domestic.identity(),
            overseas = options.overseas.identity(),
            "dns listener bound"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                domestic: options.domestic,
                overseas: options.overseas,
                classifier: options.classifier,
                journal: options.journal,
                notifier: options.notifier,
            }),
            shutdown: options.shutdown,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Ingress loop. One task reads datagrams and spawns a handler per
    /// query; the stop signal is honored between reads. Returns once the
    /// loop exited and every in-flight handler ran to completion.
    pub async fn run(self) {
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("stop signal received, closing ingress");
                    break;
                }
                received = self.shared.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let shared = Arc::clone(&self.shared);
                            let packet = buf[..len].to_vec();
                            self.tracker.spawn(handle_query(shared, packet, peer));
                        }
                        Err(err) => {
                            error!(error = %err, "udp read failed");
                        }
                    }
                }
            }
        }

        // handlers are bounded by their own deadline, wait them out
        self.tracker.close();
        self.tracker.wait().await;
        info!("dns server stopped");
    }
}

fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp socket {addr}"))?;
    UdpSocket::from_std(socket.into()).context("register udp socket with runtime")
}

/// One query end to end: decode, classify, resolve, reply with the raw
/// upstream bytes, then journal and notify. The reply goes out before the
/// journal write so the client never waits on the store.
async fn handle_query(shared: Arc<Shared>, packet: Vec<u8>, peer: SocketAddr) {
    let started = Instant::now();

    let message = match codec::decode(&packet) {
        Ok(message) => message,
        Err(err) => {
            warn!(client = %peer, error = %err, "failed to decode query");
            return;
        }
    };
    let Some(question) = codec::first_question(&message) else {
        warn!(client = %peer, msg_id = message.id(), "query carries no question");
        return;
    };

    let request_id = Uuid::new_v4();
    let qname = question.name().to_string().to_lowercase();
    let query_type = question.query_type().to_string();
    let ctx = QueryContext::with_timeout(request_id, HANDLER_BUDGET);

    let is_domestic = shared.classifier.is_domestic(request_id, &qname).await;
    let resolver = if is_domestic {
        &shared.domestic
    } else {
        &shared.overseas
    };
    debug!(
        request_id = %request_id,
        qname = %qname,
        domestic = is_domestic,
        upstream = resolver.identity(),
        "route selected"
    );

    let response = match resolver.request(&ctx, &message).await {
        Ok(response) => response,
        Err(err) => {
            error!(
                request_id = %request_id,
                qname = %qname,
                upstream = resolver.identity(),
                error = %err,
                "upstream resolution failed"
            );
            return;
        }
    };

    // raw upstream bytes go back verbatim, compression pointers included
    if let Err(err) = shared.socket.send_to(&response, peer).await {
        error!(request_id = %request_id, client = %peer, error = %err, "failed to send reply");
    }

    let response_message = match codec::decode(&response) {
        Ok(message) => message,
        Err(err) => {
            // the client already has the bytes, only the journal loses out
            warn!(request_id = %request_id, qname = %qname, error = %err, "failed to decode upstream response");
            return;
        }
    };

    let answers = codec::render_answers(&response_message);
    let record = QueryRecord {
        request_id: request_id.to_string(),
        domain: qname.trim_end_matches('.').to_string(),
        query_type,
        client_ip: peer.ip().to_string(),
        upstream: resolver.identity().to_string(),
        is_domestic,
        response_code: u16::from(response_message.response_code()),
        answer_count: answers.len(),
        total_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        created_at: Utc::now(),
        answers,
    };

    info!(
        event = "dns_query",
        request_id = %request_id,
        qname = %record.domain,
        qtype = %record.query_type,
        client_ip = %record.client_ip,
        upstream = %record.upstream,
        domestic = record.is_domestic,
        rcode = record.response_code,
        answers = record.answer_count,
        latency_ms = record.total_time_ms,
        "query completed"
    );

    match shared.journal.append(&record).await {
        Ok(()) => shared.notifier.publish(QueryEvent::query(&record)),
        Err(err) => {
            error!(request_id = %request_id, error = %err, "failed to journal query");
        }
    }
}
