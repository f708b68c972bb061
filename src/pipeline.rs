use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::activation::ActivationHandle;
use crate::blocklist::BlockStore;
use crate::cache::{Question, ResponseCache, cache_key};
use crate::config::Config;
use crate::dns::{DnsPacket, DnsResource, RData, RecordClass, RecordType, rcode};
use crate::metrics::Metrics;
use crate::records::CustomRecordSet;
use crate::resolver::Resolver;

/// Listener transport tag carried with every query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Http,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Http => "http",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IpQuery {
    None,
    V4,
    V6,
}

/// Swappable snapshots: readers clone the inner `Arc` under a short read
/// lock, reload takes the write lock for the swap only.
pub type SharedBlockStore = Arc<RwLock<Arc<BlockStore>>>;
pub type SharedCustomRecords = Arc<RwLock<Arc<CustomRecordSet>>>;

pub fn shared_block_store(store: BlockStore) -> SharedBlockStore {
    Arc::new(RwLock::new(Arc::new(store)))
}

pub fn shared_custom_records(records: CustomRecordSet) -> SharedCustomRecords {
    Arc::new(RwLock::new(Arc::new(records)))
}

struct QueryJob {
    transport: Transport,
    request: DnsPacket,
    respond: oneshot::Sender<DnsPacket>,
}

/// The per-request engine. One task consumes the job channel so cache
/// mutations for a fingerprint are never raced; listeners talk to it
/// through [`PipelineHandle`].
pub struct Pipeline {
    config: Config,
    resolver: Resolver,
    cache: ResponseCache,
    neg_cache: ResponseCache,
    block_store: SharedBlockStore,
    custom: SharedCustomRecords,
    activation: ActivationHandle,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        block_store: SharedBlockStore,
        custom: SharedCustomRecords,
        activation: ActivationHandle,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = ResponseCache::new(config.upstream.maxcount);
        let neg_cache = ResponseCache::new(config.upstream.maxcount);
        Self {
            config,
            resolver: Resolver::new(),
            cache,
            neg_cache,
            block_store,
            custom,
            activation,
            metrics,
        }
    }

    /// Answer one request: custom records, block check, caches, upstream,
    /// then CNAME following on whatever came out.
    pub async fn handle_request(&self, transport: Transport, req: DnsPacket) -> DnsPacket {
        self.metrics
            .queries
            .with_label_values(&[transport.as_str()])
            .inc();

        let Some(question) = req.first_question().cloned() else {
            self.metrics
                .responses
                .with_label_values(&["servfail"])
                .inc();
            return DnsPacket::reply_with_rcode(&req, rcode::FORMERR);
        };

        let mut resp = match self.response_for(transport, &req).await {
            Some(resp) => resp,
            None => {
                self.metrics
                    .responses
                    .with_label_values(&["servfail"])
                    .inc();
                return DnsPacket::reply_with_rcode(&req, rcode::SERVFAIL);
            }
        };

        // RFC 1034: never chase CNAMEs for a CNAME query.
        if question.qtype != RecordType::Cname {
            self.follow_cnames(transport, &question.qtype, &mut resp)
                .await;
        }

        resp.sync_counts();
        resp
    }

    /// Chase CNAME chains until an address record appears, the configured
    /// depth runs out, or no unvisited target remains. Appended records are
    /// deduplicated by their presentation form.
    async fn follow_cnames(&self, transport: Transport, qtype: &RecordType, resp: &mut DnsPacket) {
        let mut visited: HashSet<String> = HashSet::new();
        let mut depth = 0;

        while depth < self.config.follow_cname_depth {
            depth += 1;

            if resp.answers.iter().any(DnsResource::is_address) {
                break;
            }
            let targets: Vec<String> = resp
                .answers
                .iter()
                .filter_map(DnsResource::cname_target)
                .filter(|target| !visited.contains(target))
                .collect();
            if targets.is_empty() {
                break;
            }

            for target in targets {
                visited.insert(target.clone());
                let sub = DnsPacket::query(rand::random(), &target, *qtype);
                let Some(followed) = self.response_for(transport, &sub).await else {
                    continue;
                };
                for rr in followed.answers {
                    let rendered = rr.to_string();
                    if !resp.answers.iter().any(|have| have.to_string() == rendered) {
                        resp.answers.push(rr);
                    }
                }
            }
        }
    }

    /// Produce a response for one question, with cache side effects. `None`
    /// means resolution failed and the caller answers SERVFAIL.
    async fn response_for(&self, transport: Transport, req: &DnsPacket) -> Option<DnsPacket> {
        // Custom DNS first; it is already in memory and precedes blocking.
        let custom = { self.custom.read().clone() };
        if let Some(reply) = custom.resolve(req) {
            self.metrics.responses.with_label_values(&["custom"]).inc();
            return Some(reply);
        }

        let q = req.first_question()?;
        let question = Question::new(&q.qname(), q.qtype, q.qclass);
        info!("{} lookup {}", transport.as_str(), question);

        let ip_query = ip_query_kind(q.qtype, q.qclass);
        let key = cache_key(&question);
        let active = self.activation.is_active();
        let mut blacklisted = false;

        // Blocking and caching only apply to A/AAAA IN queries.
        if ip_query != IpQuery::None {
            let store = { self.block_store.read().clone() };
            blacklisted = store.exists(&question.name);

            if active && blacklisted {
                info!("{} found in blocklist", question.name);
                let reply = self.block_reply(req, ip_query);
                self.metrics.responses.with_label_values(&["blocked"]).inc();

                // We don't know a true TTL for blocked names; enforce ours.
                if let Err(err) =
                    self.cache
                        .set_with_ttl(&key, reply.clone(), true, self.config.ttl)
                {
                    error!("set {} block cache failed: {}", question, err);
                }
                self.metrics.cache_entries.set(self.cache.len() as i64);
                return Some(reply);
            }
            debug!("{} not found in blocklist", question.name);

            match self.cache.get(&key) {
                Ok((mut cached, blocked)) => {
                    if blocked && !active {
                        debug!("{} hit cache and was blocked: forwarding request", question);
                    } else {
                        debug!("{} hit cache", question);
                        // Clone carries the caller's id.
                        cached.header.id = req.header.id;
                        self.metrics.responses.with_label_values(&["cached"]).inc();
                        return Some(cached);
                    }
                }
                Err(_) => {
                    if self.neg_cache.get(&key).is_ok() {
                        debug!("{} hit negative cache", question);
                        return None;
                    }
                    debug!("{} didn't hit cache", question);
                }
            }
        }

        let started = Instant::now();
        let mut answer = match self
            .resolver
            .lookup(
                transport.as_str(),
                req,
                self.config.timeout,
                self.config.interval,
                &self.config.upstream.nameservers,
                &self.config.upstream.doh,
            )
            .await
        {
            Ok(answer) => answer,
            Err(err) => {
                error!("resolve query error: {}", err);
                self.record_upstream(transport.as_str(), "error", started);
                self.negative_cache_failure(&key, req, &question);
                return None;
            }
        };

        if answer.is_truncated() && transport == Transport::Udp {
            debug!("{} answer truncated, retrying over tcp", question);
            answer = match self
                .resolver
                .lookup(
                    "tcp",
                    req,
                    self.config.timeout,
                    self.config.interval,
                    &self.config.upstream.nameservers,
                    &self.config.upstream.doh,
                )
                .await
            {
                Ok(answer) => answer,
                Err(err) => {
                    error!("resolve tcp query error: {}", err);
                    self.record_upstream("tcp", "error", started);
                    self.negative_cache_failure(&key, req, &question);
                    return None;
                }
            };
        }
        self.record_upstream(transport.as_str(), "ok", started);

        if ip_query != IpQuery::None && !answer.answers.is_empty() {
            if !active && blacklisted {
                debug!(
                    "{} is blacklisted and blocking inactive: not caching",
                    question
                );
            } else {
                let ttl = cache_ttl(&answer, self.config.upstream.expire);
                if let Err(err) = self.cache.set_with_ttl(&key, answer.clone(), false, ttl) {
                    error!("set {} cache failed: {}", question, err);
                } else {
                    debug!("insert {} into cache with ttl {}", question, ttl);
                }
                self.metrics.cache_entries.set(self.cache.len() as i64);
            }
        }

        self.metrics
            .responses
            .with_label_values(&["forwarded"])
            .inc();
        Some(answer)
    }

    fn negative_cache_failure(&self, key: &str, req: &DnsPacket, question: &Question) {
        let reply = DnsPacket::reply_with_rcode(req, rcode::SERVFAIL);
        if let Err(err) =
            self.neg_cache
                .set_with_ttl(key, reply, false, self.config.upstream.negative_ttl)
        {
            error!("set {} negative cache failed: {}", question, err);
        }
    }

    fn record_upstream(&self, net: &str, result: &str, started: Instant) {
        self.metrics
            .upstream_resolves
            .with_label_values(&[net, result])
            .inc();
        self.metrics
            .upstream_latency
            .with_label_values(&[net])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Synthesise the reply for a blocked name: NXDOMAIN, or a sinkhole
    /// A/AAAA with the configured TTL and the question's original name.
    fn block_reply(&self, req: &DnsPacket, ip_query: IpQuery) -> DnsPacket {
        let mut reply = DnsPacket::reply_to(req);

        if self.config.blocking.nxdomain {
            reply.header.rcode = rcode::NXDOMAIN;
            reply.sync_counts();
            return reply;
        }

        let labels = req
            .first_question()
            .map(|q| q.labels.clone())
            .unwrap_or_default();
        let rdata = match ip_query {
            IpQuery::V6 => RData::Aaaa(self.config.nullroute_v6()),
            _ => RData::A(self.config.nullroute_v4()),
        };
        reply.answers.push(DnsResource {
            labels,
            rtype: match ip_query {
                IpQuery::V6 => RecordType::Aaaa,
                _ => RecordType::A,
            },
            rclass: RecordClass::In,
            ttl: self.config.ttl,
            rdata,
        });
        reply.sync_counts();
        reply
    }
}

fn ip_query_kind(qtype: RecordType, qclass: RecordClass) -> IpQuery {
    if qclass != RecordClass::In {
        return IpQuery::None;
    }
    match qtype {
        RecordType::A => IpQuery::V4,
        RecordType::Aaaa => IpQuery::V6,
        _ => IpQuery::None,
    }
}

/// Smallest answer TTL, capped by the configured ceiling.
fn cache_ttl(answer: &DnsPacket, expire: u32) -> u32 {
    answer
        .answers
        .iter()
        .map(|rr| rr.ttl)
        .min()
        .unwrap_or(0)
        .min(expire)
}

/// Submission side of the pipeline. Cloneable; `stop` flips the handle to
/// Draining (in-flight jobs finish, the consumer exits once the channel
/// drains) after which submissions are dropped.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: Arc<RwLock<Option<mpsc::Sender<QueryJob>>>>,
}

impl PipelineHandle {
    /// Spawn the consumer task over `pipeline`.
    pub fn spawn(pipeline: Pipeline) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueryJob>(1024);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let reply = pipeline.handle_request(job.transport, job.request).await;
                if job.respond.send(reply).is_err() {
                    debug!("client went away before the reply was ready");
                }
            }
            debug!("pipeline drained, stopping");
        });

        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    /// Submit a request and wait for its reply. `None` when the pipeline is
    /// stopped or the request was dropped mid-flight.
    pub async fn process(&self, transport: Transport, request: DnsPacket) -> Option<DnsPacket> {
        let sender = { self.tx.read().as_ref().cloned() };
        let sender = match sender {
            Some(sender) => sender,
            None => {
                warn!("query dropped: pipeline is stopped");
                return None;
            }
        };

        let (respond, reply) = oneshot::channel();
        sender
            .send(QueryJob {
                transport,
                request,
                respond,
            })
            .await
            .ok()?;
        reply.await.ok()
    }

    /// Stop accepting queries; the consumer drains what is already queued.
    /// Safe to call more than once.
    pub fn stop(&self) {
        self.tx.write().take();
    }

    pub fn is_accepting(&self) -> bool {
        self.tx.read().is_some()
    }
}
