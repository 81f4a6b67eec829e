//! The announcement-driven transaction fetcher.
//!
//! The fetcher operates in 3 stages:
//!   - Hashes that are newly announced are moved into a wait list, giving the
//!     full transaction time to arrive over gossip without a request.
//!   - After the arrive timeout passes, hashes that have not been broadcast
//!     in whole are moved into a queueing area.
//!   - When a peer has no retrieval request in flight, queued hashes it
//!     announced are allocated to it and moved into a fetching state until
//!     the request is fulfilled or fails.
//!
//! The invariants of the fetcher are:
//!   - Each tracked hash is present in exactly one of the three stages, so
//!     the fetcher operates as a finite state automaton with no data leak.
//!   - Each peer that announced transactions may be scheduled retrievals, but
//!     only ever one concurrently, so a reply immediately tells us what is
//!     missing and needs rescheduling.

use crate::{
    cache::UnderpricedCache,
    client::DynFetchClient,
    config::TxFetcherConfig,
    handle::TxFetcherHandle,
    message::{FetcherEvent, TxAnnounce, TxDelivery},
    metrics::TxFetcherMetrics,
    pool::DynTxPool,
    primitives::{PeerId, TxHash, TxMetadata},
    validation::{verify_announced_metadata, ValidationOutcome},
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, trace, warn};

/// An announcement bookkeeping entry: the metadata a peer claimed for a hash,
/// plus the global arrival sequence number used to preserve announcement
/// order across map iteration.
#[derive(Debug, Clone, Copy)]
struct AnnounceData {
    meta: TxMetadata,
    seq: u64,
}

/// An in-flight retrieval request to a specific peer.
#[derive(Debug)]
struct InflightRequest {
    /// Requested hashes, in request order. Cleared when the request times
    /// out, leaving the entry behind as a dangling marker so the peer isn't
    /// scheduled again until it delivers late or disconnects.
    hashes: Vec<TxHash>,
    /// Hashes delivered by someone else while this request was in flight.
    /// These must not be rescheduled when the request resolves.
    stolen: HashSet<TxHash>,
    /// When the request was dispatched.
    sent_at: Instant,
}

impl InflightRequest {
    fn is_dangling(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// The service half of the transaction fetcher: a single event loop owning
/// every index, fed through the channel behind [`TxFetcherHandle`].
///
/// Spawn [`TxFetcher::run`] as a background task and keep the handle as the
/// frontend.
#[must_use = "the fetcher does nothing unless its event loop is run"]
pub struct TxFetcher {
    config: TxFetcherConfig,
    client: DynFetchClient,
    events: mpsc::UnboundedReceiver<FetcherEvent>,
    /// Sender clone handed to dispatch tasks so wire failures come back as
    /// peer-drop events.
    events_tx: mpsc::UnboundedSender<FetcherEvent>,

    /// Next announcement sequence number.
    tx_seq: u64,

    // Stage 1: hashes waiting for a potential broadcast.
    waitlist: HashMap<TxHash, HashSet<PeerId>>,
    waittime: HashMap<TxHash, Instant>,
    waitslots: HashMap<PeerId, HashMap<TxHash, AnnounceData>>,

    // Stage 2: hashes queued for retrieval, by hash and by origin peer. The
    // per-peer map is shared with stage 3 for DoS accounting.
    announced: HashMap<TxHash, HashSet<PeerId>>,
    announces: HashMap<PeerId, HashMap<TxHash, AnnounceData>>,

    // Stage 3: hashes currently being retrieved.
    fetching: HashMap<TxHash, PeerId>,
    requests: HashMap<PeerId, InflightRequest>,
    alternates: HashMap<TxHash, HashSet<PeerId>>,

    /// Deadline of the next wait-list promotion scan, if armed.
    wait_deadline: Option<Instant>,
    /// Deadline of the next request timeout scan, if armed.
    timeout_deadline: Option<Instant>,

    metrics: TxFetcherMetrics,

    /// Deterministic peer iteration for tests; production iterates the maps.
    rng: Option<StdRng>,
    /// Per-iteration notification for lockstep tests.
    step: Option<mpsc::UnboundedSender<()>>,
}

impl TxFetcher {
    /// Creates a fetcher service and its frontend handle.
    ///
    /// `pool` and `client` are the injected capabilities described in the
    /// crate docs; the fetcher itself never validates or decodes a
    /// transaction.
    pub fn new(
        config: TxFetcherConfig,
        pool: DynTxPool,
        client: DynFetchClient,
    ) -> (Self, TxFetcherHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let underpriced = Arc::new(Mutex::new(UnderpricedCache::new(
            config.max_underpriced_set_size,
            config.underpriced_entry_timeout,
        )));
        let handle = TxFetcherHandle::new(events_tx.clone(), pool, underpriced);
        let fetcher = Self {
            config,
            client,
            events,
            events_tx,
            tx_seq: 0,
            waitlist: Default::default(),
            waittime: Default::default(),
            waitslots: Default::default(),
            announced: Default::default(),
            announces: Default::default(),
            fetching: Default::default(),
            requests: Default::default(),
            alternates: Default::default(),
            wait_deadline: None,
            timeout_deadline: None,
            metrics: Default::default(),
            rng: None,
            step: None,
        };
        (fetcher, handle)
    }

    /// Creates a fetcher with a seeded RNG for deterministic peer iteration
    /// and a step channel that notifies once per loop iteration, after all
    /// indices are updated.
    pub fn for_tests(
        config: TxFetcherConfig,
        pool: DynTxPool,
        client: DynFetchClient,
        seed: u64,
    ) -> (Self, TxFetcherHandle, mpsc::UnboundedReceiver<()>) {
        let (mut fetcher, handle) = Self::new(config, pool, client);
        fetcher.rng = Some(StdRng::seed_from_u64(seed));
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        fetcher.step = Some(step_tx);
        (fetcher, handle, step_rx)
    }

    /// Runs the fetcher event loop until a quit event arrives or every handle
    /// is gone. Each event is processed to completion before the next receive
    /// so the indices always agree between events.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        Some(FetcherEvent::Quit) | None => return,
                        Some(event) => self.process(event),
                    }
                }
                () = deadline_timer(self.wait_deadline) => self.on_wait_expired(),
                () = deadline_timer(self.timeout_deadline) => self.on_timeout_expired(),
            }

            self.update_gauges();
            if let Some(step) = &self.step {
                let _ = step.send(());
            }
        }
    }

    fn process(&mut self, event: FetcherEvent) {
        match event {
            FetcherEvent::Announce(ann) => self.on_announce(ann),
            FetcherEvent::Delivery(delivery) => self.on_delivery(delivery),
            FetcherEvent::PeerDrop(peer) => self.on_peer_drop(peer),
            FetcherEvent::Quit => unreachable!("quit is intercepted by the loop"),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.tx_seq;
        self.tx_seq += 1;
        seq
    }

    /// Tracks a pre-filtered announcement batch.
    fn on_announce(&mut self, ann: TxAnnounce) {
        let TxAnnounce { origin, mut hashes, mut metas } = ann;

        // Drop part of the new announcements if the peer has too many live
        // already. A peer can legitimately exceed its cap slightly when
        // partially fulfilled requests reschedule hashes without a cap check,
        // which is fine since the cap is in the thousands and requests in the
        // hundreds.
        let used = self.waitslots.get(&origin).map_or(0, HashMap::len) +
            self.announces.get(&origin).map_or(0, HashMap::len);
        if used >= self.config.max_announced_hashes_per_peer {
            self.metrics.announces_dos.increment(hashes.len() as u64);
            return;
        }
        let capacity = self.config.max_announced_hashes_per_peer - used;
        if hashes.len() > capacity {
            self.metrics.announces_dos.increment((hashes.len() - capacity) as u64);
            hashes.truncate(capacity);
            metas.truncate(capacity);
        }

        let idle_wait = self.waittime.is_empty();
        let old_peer = self.announces.contains_key(&origin);
        let mut has_blob = false;

        for (hash, meta) in hashes.into_iter().zip(metas) {
            // Already downloading: register the peer as a possible alternate
            // in case the current retrieval fails, and account the hash to
            // the peer.
            if let Some(alternates) = self.alternates.get_mut(&hash) {
                alternates.insert(origin);
                let seq = self.next_seq();
                self.announces.entry(origin).or_default().insert(hash, AnnounceData { meta, seq });
                continue;
            }
            // Not downloading but already queued from a different peer: track
            // it for the new peer too.
            if let Some(peers) = self.announced.get_mut(&hash) {
                peers.insert(origin);
                let seq = self.next_seq();
                self.announces.entry(origin).or_default().insert(hash, AnnounceData { meta, seq });
                continue;
            }
            // Known but still waiting: add the peer as an alternate origin in
            // the wait list. Double announcements from the same peer are
            // ignored so a malicious peer can't flip-flop the metadata.
            if let Some(peers) = self.waitlist.get_mut(&hash) {
                if !peers.insert(origin) {
                    continue;
                }
                let seq = self.next_seq();
                self.waitslots.entry(origin).or_default().insert(hash, AnnounceData { meta, seq });
                continue;
            }
            // Unknown hash, insert it into the wait list. Blob transactions
            // are never broadcast in full, so they skip the wait and become
            // requestable immediately.
            self.waitlist.insert(hash, HashSet::from([origin]));
            let now = Instant::now();
            if meta.is_blob() {
                has_blob = true;
                let skipped = now.checked_sub(self.config.tx_arrive_timeout).unwrap_or(now);
                self.waittime.insert(hash, skipped);
            } else {
                self.waittime.insert(hash, now);
            }
            let seq = self.next_seq();
            self.waitslots.entry(origin).or_default().insert(hash, AnnounceData { meta, seq });
        }

        // A first wait-list entry (or a wait-skipping blob) needs the wait
        // timer running.
        if has_blob || (idle_wait && !self.waittime.is_empty()) {
            self.reschedule_wait();
        }
        // If this peer is new and announced something already queued, maybe
        // request from it right away.
        if !old_peer && self.announces.get(&origin).is_some_and(|a| !a.is_empty()) {
            self.schedule_fetches(Some(HashSet::from([origin])));
        }
    }

    /// Promotes every wait-list entry whose broadcast window ran out into the
    /// retrieval queues and tries to schedule fetches for the touched peers.
    fn on_wait_expired(&mut self) {
        self.wait_deadline = None;
        let now = Instant::now();

        let expired: Vec<TxHash> = self
            .waittime
            .iter()
            .filter(|(_, &instance)| {
                now - instance + self.config.tx_gather_slack > self.config.tx_arrive_timeout
            })
            .map(|(hash, _)| *hash)
            .collect();

        let mut actives: HashSet<PeerId> = HashSet::new();
        for hash in expired {
            self.waittime.remove(&hash);
            let peers = self.waitlist.remove(&hash).expect("waiting hash must have a waitlist entry");
            assert!(
                !self.announced.contains_key(&hash),
                "queued tracker already contains waitlist item"
            );
            for peer in &peers {
                let slot = self
                    .waitslots
                    .get_mut(peer)
                    .and_then(|slots| slots.remove(&hash))
                    .expect("waiting hash must have a waitslot entry per announcing peer");
                if self.waitslots.get(peer).is_some_and(HashMap::is_empty) {
                    self.waitslots.remove(peer);
                }
                self.announces.entry(*peer).or_default().insert(hash, slot);
                actives.insert(*peer);
            }
            self.announced.insert(hash, peers);
        }

        if !self.waittime.is_empty() {
            self.reschedule_wait();
        }
        if !actives.is_empty() {
            self.schedule_fetches(Some(actives));
        }
    }

    /// Reschedules every hash of every expired retrieval onto alternate peers
    /// and marks the expired requests dangling. The slow peer is neither
    /// disconnected nor re-used for these hashes; punishing it further would
    /// only add load to an overloaded node.
    fn on_timeout_expired(&mut self) {
        self.timeout_deadline = None;
        let now = Instant::now();

        let expired: Vec<PeerId> = self
            .requests
            .iter()
            .filter(|(_, req)| {
                !req.is_dangling() &&
                    now - req.sent_at + self.config.tx_gather_slack > self.config.tx_fetch_timeout
            })
            .map(|(peer, _)| *peer)
            .collect();

        for peer in expired {
            let req = self.requests.get_mut(&peer).expect("expired request must exist");
            // Clearing the hashes marks the request dangling while keeping
            // the peer blocked from further scheduling.
            let hashes = mem::take(&mut req.hashes);
            let stolen = req.stolen.clone();
            self.metrics.requests_timeout.increment(hashes.len() as u64);
            debug!(target: "fetcher::tx", peer_id = %peer, hashes = hashes.len(), "transaction request timed out");

            for hash in hashes {
                // Hashes already delivered by someone else need no rescue.
                if stolen.contains(&hash) {
                    continue;
                }
                assert!(
                    !self.announced.contains_key(&hash),
                    "queued tracker already contains alternate item"
                );
                if let Some(mut alternates) = self.alternates.remove(&hash) {
                    alternates.remove(&peer);
                    if !alternates.is_empty() {
                        self.announced.insert(hash, alternates);
                    }
                }
                if let Some(peer_announces) = self.announces.get_mut(&peer) {
                    peer_announces.remove(&hash);
                }
                self.fetching.remove(&hash);
            }
            if self.announces.get(&peer).is_some_and(HashMap::is_empty) {
                self.announces.remove(&peer);
            }
        }

        // Freed hashes may be assignable elsewhere.
        self.schedule_fetches(None);
        self.reschedule_timeout();
    }

    /// Untracks a batch of delivered hashes and, for direct replies,
    /// reconciles the originating request.
    fn on_delivery(&mut self, delivery: TxDelivery) {
        for (hash, meta) in delivery.hashes.iter().zip(delivery.metas.iter()) {
            // Whatever the delivery was, compare the advertised metadata with
            // the real thing and drop peers that lied.
            if self.waitlist.contains_key(hash) {
                let mut emptied = Vec::new();
                for (peer, slots) in self.waitslots.iter_mut() {
                    if let Some(data) = slots.get(hash) {
                        Self::verify_announcement(&self.client, *peer, *hash, &data.meta, meta);
                    }
                    slots.remove(hash);
                    if slots.is_empty() {
                        emptied.push(*peer);
                    }
                }
                for peer in emptied {
                    self.waitslots.remove(&peer);
                }
                self.waitlist.remove(hash);
                self.waittime.remove(hash);
            } else {
                let mut emptied = Vec::new();
                for (peer, set) in self.announces.iter_mut() {
                    if let Some(data) = set.get(hash) {
                        Self::verify_announcement(&self.client, *peer, *hash, &data.meta, meta);
                    }
                    set.remove(hash);
                    if set.is_empty() {
                        emptied.push(*peer);
                    }
                }
                for peer in emptied {
                    self.announces.remove(&peer);
                }
                self.announced.remove(hash);
                self.alternates.remove(hash);

                // If the hash was being fetched from a different origin (or
                // arrived over broadcast), mark it stolen so the pending
                // request doesn't reschedule it on resolution.
                if let Some(origin) = self.fetching.remove(hash) {
                    if origin != delivery.origin || !delivery.direct {
                        let req = self
                            .requests
                            .get_mut(&origin)
                            .expect("fetching hash must have an in-flight request");
                        req.stolen.insert(*hash);
                    }
                }
            }
        }

        // A direct reply also resolves the originating request; anything it
        // left out gets rescheduled with or without this peer, depending on
        // where the response was cut off.
        if delivery.direct {
            self.metrics.requests_done.increment(delivery.hashes.len() as u64);

            let Some(req) = self.requests.remove(&delivery.origin) else {
                warn!(target: "fetcher::tx", peer_id = %delivery.origin, "unexpected transaction delivery");
                return;
            };

            let delivered: HashSet<TxHash> = delivery.hashes.iter().copied().collect();

            // The cutoff is the last delivered hash in request order. Earlier
            // undelivered hashes were skipped on purpose; later ones fell
            // victim to response size truncation. If nothing was delivered,
            // everything counts as skipped and this peer is not retried.
            let mut cutoff = req.hashes.len();
            for (i, hash) in req.hashes.iter().enumerate() {
                if delivered.contains(hash) {
                    cutoff = i;
                }
            }

            for (i, hash) in req.hashes.iter().enumerate() {
                if req.stolen.contains(hash) {
                    continue;
                }
                if !delivered.contains(hash) {
                    if i < cutoff {
                        if let Some(alternates) = self.alternates.get_mut(hash) {
                            alternates.remove(&delivery.origin);
                        }
                        let emptied = self
                            .announces
                            .get_mut(&delivery.origin)
                            .map(|set| {
                                set.remove(hash);
                                set.is_empty()
                            })
                            .unwrap_or(false);
                        if emptied {
                            self.announces.remove(&delivery.origin);
                        }
                    }
                    if let Some(alternates) = self.alternates.remove(hash) {
                        if !alternates.is_empty() {
                            assert!(
                                !self.announced.contains_key(hash),
                                "queued tracker already contains alternate item"
                            );
                            self.announced.insert(*hash, alternates);
                        }
                    }
                } else {
                    self.alternates.remove(hash);
                }
                self.fetching.remove(hash);
            }

            // A partial delivery may have freed slots for others.
            self.schedule_fetches(None);
        }
    }

    fn verify_announcement(
        client: &DynFetchClient,
        peer: PeerId,
        hash: TxHash,
        announced: &TxMetadata,
        delivered: &TxMetadata,
    ) {
        match verify_announced_metadata(announced, delivered) {
            ValidationOutcome::Valid => {}
            ValidationOutcome::Warn => {
                warn!(
                    target: "fetcher::tx",
                    peer_id = %peer,
                    %hash,
                    announced_size = announced.size,
                    size = delivered.size,
                    "announced transaction size slightly off"
                );
            }
            ValidationOutcome::ReportPeer => {
                warn!(
                    target: "fetcher::tx",
                    peer_id = %peer,
                    %hash,
                    announced_kind = announced.kind,
                    kind = delivered.kind,
                    announced_size = announced.size,
                    size = delivered.size,
                    "announced transaction metadata mismatch"
                );
                client.disconnect_peer(peer);
            }
        }
    }

    /// Removes all traces of a disconnected peer and reschedules anything it
    /// was supposed to deliver.
    fn on_peer_drop(&mut self, peer: PeerId) {
        if let Some(slots) = self.waitslots.remove(&peer) {
            for hash in slots.keys() {
                let emptied = self
                    .waitlist
                    .get_mut(hash)
                    .map(|peers| {
                        peers.remove(&peer);
                        peers.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    self.waitlist.remove(hash);
                    self.waittime.remove(hash);
                }
            }
            if !self.waitlist.is_empty() {
                self.reschedule_wait();
            }
        }

        // Cancel the in-flight request, if any, falling back to alternate
        // origins for every hash not already delivered by someone else.
        let request = self.requests.remove(&peer);
        if let Some(req) = &request {
            for hash in &req.hashes {
                if req.stolen.contains(hash) {
                    continue;
                }
                if let Some(mut alternates) = self.alternates.remove(hash) {
                    alternates.remove(&peer);
                    if !alternates.is_empty() {
                        self.announced.insert(*hash, alternates);
                    }
                }
                self.fetching.remove(hash);
            }
        }

        if let Some(set) = self.announces.remove(&peer) {
            for hash in set.keys() {
                let emptied = self
                    .announced
                    .get_mut(hash)
                    .map(|peers| {
                        peers.remove(&peer);
                        peers.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    self.announced.remove(hash);
                }
            }
        }

        if request.is_some() {
            self.schedule_fetches(None);
            self.reschedule_timeout();
        }
    }

    /// Starts a batch of retrievals for all idle peers, or for the given
    /// whitelist only.
    ///
    /// Peers are visited in map order in production; tests inject a seeded
    /// RNG for a deterministic sorted-rotated order. A peer's announcements
    /// are always packed in arrival order to minimise the chance of nonce
    /// gaps downstream.
    fn schedule_fetches(&mut self, whitelist: Option<HashSet<PeerId>>) {
        let actives: Vec<PeerId> = match whitelist {
            Some(peers) => peers.into_iter().collect(),
            None => self.announces.keys().copied().collect(),
        };
        if actives.is_empty() {
            return;
        }
        let idle = self.requests.is_empty();

        for peer in self.peer_order(actives) {
            // Single-flight per peer; a dangling request blocks too.
            if self.requests.contains_key(&peer) {
                continue;
            }
            let Some(peer_announces) = self.announces.get(&peer) else { continue };
            if peer_announces.is_empty() {
                continue;
            }

            let mut entries: Vec<(TxHash, TxMetadata, u64)> =
                peer_announces.iter().map(|(hash, data)| (*hash, data.meta, data.seq)).collect();
            entries.sort_unstable_by_key(|(_, _, seq)| *seq);

            let mut hashes = Vec::with_capacity(self.config.max_hashes_per_request.min(entries.len()));
            let mut bytes: u64 = 0;
            for (hash, meta, _) in entries {
                if self.fetching.contains_key(&hash) {
                    continue;
                }
                // Mark the hash fetching and stash the queued origins away as
                // alternates for the case the retrieval fails.
                self.fetching.insert(hash, peer);
                assert!(
                    !self.alternates.contains_key(&hash),
                    "alternate tracker already contains fetching item"
                );
                let alternates = self.announced.remove(&hash).unwrap_or_default();
                self.alternates.insert(hash, alternates);

                hashes.push(hash);
                if hashes.len() >= self.config.max_hashes_per_request {
                    break;
                }
                bytes += u64::from(meta.size);
                if bytes >= self.config.max_announced_bytes_per_request {
                    break;
                }
            }
            if hashes.is_empty() {
                continue;
            }

            trace!(target: "fetcher::tx", peer_id = %peer, hashes = hashes.len(), "requesting announced transactions");
            self.metrics.requests_out.increment(hashes.len() as u64);
            self.requests.insert(
                peer,
                InflightRequest { hashes: hashes.clone(), stolen: HashSet::new(), sent_at: Instant::now() },
            );
            self.dispatch_fetch(peer, hashes);
        }

        // First request in flight arms the timeout timer.
        if idle && !self.requests.is_empty() {
            self.reschedule_timeout();
        }
    }

    /// Hands the wire request to a spawned task so the loop never blocks on
    /// the client. A dispatch failure comes back as a peer-drop event.
    fn dispatch_fetch(&self, peer: PeerId, hashes: Vec<TxHash>) {
        let client = Arc::clone(&self.client);
        let events = self.events_tx.clone();
        let fail_counter = self.metrics.requests_fail.clone();
        tokio::spawn(async move {
            if let Err(err) = client.fetch_txs(peer, hashes.clone()) {
                debug!(target: "fetcher::tx", peer_id = %peer, %err, "failed to dispatch transaction request");
                fail_counter.increment(hashes.len() as u64);
                let _ = events.send(FetcherEvent::PeerDrop(peer));
            }
        });
    }

    /// Visits peers in nondeterministic map order, unless a test RNG is
    /// present, in which case the order is sorted and rotated by a random
    /// offset to stay reproducible while still exercising rotation.
    fn peer_order(&mut self, mut peers: Vec<PeerId>) -> Vec<PeerId> {
        if let Some(rng) = &mut self.rng {
            peers.sort_unstable();
            let offset = rng.gen_range(0..peers.len());
            peers.rotate_left(offset);
        }
        peers
    }

    /// Arms the wait timer for the earliest unexpired wait-list entry.
    ///
    /// The scan stops early once an entry within the gather slack is found;
    /// there is no point chasing a deadline a few milliseconds earlier.
    fn reschedule_wait(&mut self) {
        let now = Instant::now();
        let mut earliest = now;
        for &instance in self.waittime.values() {
            if earliest > instance {
                earliest = instance;
                if self.config.tx_arrive_timeout.saturating_sub(now - earliest) <
                    self.config.tx_gather_slack
                {
                    break;
                }
            }
        }
        self.wait_deadline = Some(earliest + self.config.tx_arrive_timeout);
    }

    /// Arms the timeout timer for the earliest live (non-dangling) request.
    ///
    /// Always re-arms even when only dangling requests remain: scheduling
    /// counts any request entry as busy, so skipping the re-arm here would
    /// leave new requests without a timeout once every old one expired.
    fn reschedule_timeout(&mut self) {
        let now = Instant::now();
        let mut earliest = now;
        for req in self.requests.values() {
            if req.is_dangling() {
                continue;
            }
            if earliest > req.sent_at {
                earliest = req.sent_at;
                if self.config.tx_fetch_timeout.saturating_sub(now - earliest) <
                    self.config.tx_gather_slack
                {
                    break;
                }
            }
        }
        self.timeout_deadline = Some(earliest + self.config.tx_fetch_timeout);
    }

    fn update_gauges(&self) {
        self.metrics.waiting_peers.set(self.waitslots.len() as f64);
        self.metrics.waiting_hashes.set(self.waitlist.len() as f64);
        self.metrics.queueing_peers.set(self.announces.len().saturating_sub(self.requests.len()) as f64);
        self.metrics.queueing_hashes.set(self.announced.len() as f64);
        self.metrics.fetching_peers.set(self.requests.len() as f64);
        self.metrics.fetching_hashes.set(self.fetching.len() as f64);
    }
}

/// Sleeps until the deadline, or forever while the timer is unarmed.
async fn deadline_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::NewPooledTransactionHashes,
        pool::PoolImportError,
        primitives::{PooledTransaction, BLOB_TX_TYPE_ID},
        test_utils::{hash_n, init_test_tracing, peer_n, MockClient, MockPool},
    };
    use std::time::Duration;

    fn new_fetcher(
        config: TxFetcherConfig,
    ) -> (TxFetcher, TxFetcherHandle, Arc<MockPool>, Arc<MockClient>) {
        init_test_tracing();
        let pool = MockPool::new();
        let client = MockClient::new();
        let (fetcher, handle, _step) =
            TxFetcher::for_tests(config, pool.clone(), client.clone(), 0);
        (fetcher, handle, pool, client)
    }

    /// Feeds every queued event through the state machine, like one loop
    /// burst would.
    fn drain(fetcher: &mut TxFetcher) {
        while let Ok(event) = fetcher.events.try_recv() {
            match event {
                FetcherEvent::Quit => return,
                event => fetcher.process(event),
            }
        }
    }

    fn announce(
        handle: &TxFetcherHandle,
        peer: PeerId,
        entries: &[(TxHash, u8, u32)],
    ) {
        let msg = NewPooledTransactionHashes::new(
            entries.iter().map(|(_, kind, _)| *kind).collect(),
            entries.iter().map(|(_, _, size)| *size).collect(),
            entries.iter().map(|(hash, _, _)| *hash).collect(),
        );
        handle.notify(peer, msg).unwrap();
    }

    /// The universal stage/bookkeeping invariants, checked after events.
    fn assert_invariants(fetcher: &TxFetcher) {
        // a hash lives in exactly one stage
        for hash in fetcher.waitlist.keys() {
            assert!(!fetcher.announced.contains_key(hash), "waiting hash also queued");
            assert!(!fetcher.fetching.contains_key(hash), "waiting hash also fetching");
        }
        for hash in fetcher.announced.keys() {
            assert!(!fetcher.fetching.contains_key(hash), "queued hash also fetching");
        }
        // waiting-stage indices agree
        assert_eq!(fetcher.waitlist.len(), fetcher.waittime.len());
        for (hash, peers) in &fetcher.waitlist {
            assert!(!peers.is_empty());
            for peer in peers {
                assert!(
                    fetcher.waitslots.get(peer).is_some_and(|slots| slots.contains_key(hash)),
                    "waitlist peer without waitslot entry"
                );
            }
        }
        // fetching-stage indices agree
        for (hash, peer) in &fetcher.fetching {
            let req = fetcher.requests.get(peer).expect("fetching hash without request");
            assert!(req.hashes.contains(hash), "fetching hash missing from request");
            assert!(fetcher.alternates.contains_key(hash), "fetching hash without alternates");
        }
        // per-peer cap and request limits
        let peers: HashSet<PeerId> = fetcher
            .waitslots
            .keys()
            .chain(fetcher.announces.keys())
            .copied()
            .collect();
        for peer in peers {
            let used = fetcher.waitslots.get(&peer).map_or(0, HashMap::len) +
                fetcher.announces.get(&peer).map_or(0, HashMap::len);
            assert!(used <= fetcher.config.max_announced_hashes_per_peer, "per-peer cap exceeded");
        }
        for req in fetcher.requests.values() {
            assert!(req.hashes.len() <= fetcher.config.max_hashes_per_request);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_single_peer() {
        let (mut fetcher, handle, pool, client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(0xAA));

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        assert!(fetcher.waitlist.contains_key(&hash));
        assert_invariants(&fetcher);

        // broadcast window runs out, the hash gets queued and requested
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();
        assert_eq!(fetcher.fetching.get(&hash), Some(&peer));
        assert_eq!(fetcher.requests.get(&peer).unwrap().hashes, vec![hash]);
        assert_invariants(&fetcher);

        tokio::task::yield_now().await;
        assert_eq!(client.requests(), vec![(peer, vec![hash])]);

        // the reply clears every index
        handle.enqueue(peer, vec![PooledTransaction::new(hash, 0, 100)], true).await.unwrap();
        drain(&mut fetcher);
        assert!(fetcher.waitlist.is_empty());
        assert!(fetcher.announced.is_empty());
        assert!(fetcher.announces.is_empty());
        assert!(fetcher.fetching.is_empty());
        assert!(fetcher.alternates.is_empty());
        assert!(fetcher.requests.is_empty());
        assert!(pool.contains(&hash));
        assert!(client.disconnected().is_empty());
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_steals_fetching_hash() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer_a, peer_b, hash) = (peer_n(1), peer_n(2), hash_n(0xBB));

        announce(&handle, peer_a, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();
        assert_eq!(fetcher.fetching.get(&hash), Some(&peer_a));

        // the full transaction arrives over gossip from someone else
        handle.enqueue(peer_b, vec![PooledTransaction::new(hash, 0, 100)], false).await.unwrap();
        drain(&mut fetcher);

        assert!(fetcher.fetching.is_empty());
        assert!(fetcher.announced.is_empty());
        assert!(fetcher.alternates.is_empty());
        assert!(fetcher.requests.get(&peer_a).unwrap().stolen.contains(&hash));

        // the late reply must not reschedule the stolen hash
        handle.enqueue(peer_a, vec![PooledTransaction::new(hash, 0, 100)], true).await.unwrap();
        drain(&mut fetcher);
        assert!(fetcher.requests.is_empty());
        assert!(fetcher.announced.is_empty());
        tokio::task::yield_now().await;
        assert_eq!(client.requests().len(), 1);
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn per_peer_cap_truncates_then_drops() {
        let (mut fetcher, handle, _pool, _client) = new_fetcher(Default::default());
        let peer = peer_n(1);

        let batch: Vec<(TxHash, u8, u32)> = (0..4100).map(|i| (hash_n(i), 0, 100)).collect();
        announce(&handle, peer, &batch);
        drain(&mut fetcher);
        assert_eq!(fetcher.waitslots.get(&peer).unwrap().len(), 4096);
        // the head of the batch survives
        assert!(fetcher.waitlist.contains_key(&hash_n(0)));
        assert!(!fetcher.waitlist.contains_key(&hash_n(4096)));
        assert_invariants(&fetcher);

        // the peer is saturated, further batches are dropped wholesale
        announce(&handle, peer, &[(hash_n(5000), 0, 100)]);
        drain(&mut fetcher);
        assert_eq!(fetcher.waitslots.get(&peer).unwrap().len(), 4096);
        assert!(!fetcher.waitlist.contains_key(&hash_n(5000)));
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn announced_kind_mismatch_drops_peer() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(0xCC));

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);

        // delivered as kind 2 although announced as kind 0
        handle.enqueue(peer, vec![PooledTransaction::new(hash, 2, 100)], false).await.unwrap();
        drain(&mut fetcher);

        assert_eq!(client.disconnected(), vec![peer]);
        assert!(fetcher.waitlist.is_empty());
        assert!(fetcher.waitslots.is_empty());
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn announced_size_mismatch_tolerance() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let peer = peer_n(1);
        let (close, off) = (hash_n(1), hash_n(2));

        announce(&handle, peer, &[(close, 0, 100)]);
        drain(&mut fetcher);
        // 4 bytes off: tolerated
        handle.enqueue(peer, vec![PooledTransaction::new(close, 0, 104)], false).await.unwrap();
        drain(&mut fetcher);
        assert!(client.disconnected().is_empty());

        announce(&handle, peer, &[(off, 0, 100)]);
        drain(&mut fetcher);
        // 100 bytes off: protocol violation
        handle.enqueue(peer, vec![PooledTransaction::new(off, 0, 200)], false).await.unwrap();
        drain(&mut fetcher);
        assert_eq!(client.disconnected(), vec![peer]);
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reschedules_onto_alternate() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer_a, peer_b, hash) = (peer_n(1), peer_n(2), hash_n(0xDD));

        announce(&handle, peer_a, &[(hash, 0, 100)]);
        announce(&handle, peer_b, &[(hash, 0, 100)]);
        drain(&mut fetcher);

        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();
        let assigned = *fetcher.fetching.get(&hash).unwrap();
        let other = if assigned == peer_a { peer_b } else { peer_a };
        assert_invariants(&fetcher);

        // no reply until far past the fetch deadline
        time::advance(Duration::from_millis(5100)).await;
        fetcher.on_timeout_expired();

        // the slow peer stays blocked behind its dangling request while the
        // hash moves on to the alternate
        assert!(fetcher.requests.get(&assigned).unwrap().is_dangling());
        assert_eq!(fetcher.fetching.get(&hash), Some(&other));
        assert!(fetcher.requests.contains_key(&other));
        assert_invariants(&fetcher);

        tokio::task::yield_now().await;
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], (other, vec![hash]));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_alternate_drops_hash() {
        let (mut fetcher, handle, _pool, _client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(0xEE));

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        time::advance(Duration::from_millis(5100)).await;
        fetcher.on_timeout_expired();

        assert!(fetcher.fetching.is_empty());
        assert!(fetcher.announced.is_empty());
        assert!(fetcher.alternates.is_empty());
        assert!(fetcher.announces.is_empty());
        assert!(fetcher.requests.get(&peer).unwrap().is_dangling());
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_reply_cutoff() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer_a, peer_b) = (peer_n(1), peer_n(2));
        let (h1, h2, h3, h4) = (hash_n(1), hash_n(2), hash_n(3), hash_n(4));

        announce(&handle, peer_a, &[(h1, 0, 100), (h2, 0, 100), (h3, 0, 100), (h4, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();
        assert_eq!(fetcher.requests.get(&peer_a).unwrap().hashes, vec![h1, h2, h3, h4]);

        // a second announcer for h2 shows up mid-flight and becomes a
        // fallback origin
        announce(&handle, peer_b, &[(h2, 0, 100)]);
        drain(&mut fetcher);
        assert!(fetcher.alternates.get(&h2).unwrap().contains(&peer_b));

        // peer A delivers h1 and h3: h2 (before the cutoff) was skipped on
        // purpose, h4 (after the cutoff) was truncated away
        handle
            .enqueue(
                peer_a,
                vec![PooledTransaction::new(h1, 0, 100), PooledTransaction::new(h3, 0, 100)],
                true,
            )
            .await
            .unwrap();
        drain(&mut fetcher);

        // h2 is retried from peer B only, h4 from peer A again
        assert_eq!(fetcher.fetching.get(&h2), Some(&peer_b));
        assert_eq!(fetcher.fetching.get(&h4), Some(&peer_a));
        assert_invariants(&fetcher);

        tokio::task::yield_now().await;
        let requests = client.requests();
        assert!(requests.contains(&(peer_b, vec![h2])));
        assert!(requests.contains(&(peer_a, vec![h4])));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_skips_origin_everywhere() {
        let (mut fetcher, handle, _pool, _client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(7));

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        // an empty direct reply means the peer declined everything
        handle.enqueue(peer, vec![], true).await.unwrap();
        drain(&mut fetcher);

        assert!(fetcher.requests.is_empty());
        assert!(fetcher.fetching.is_empty());
        // no alternate was left, the hash dies silently
        assert!(fetcher.announced.is_empty());
        assert!(fetcher.announces.is_empty());
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_drop_purges_and_reschedules() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer_a, peer_b) = (peer_n(1), peer_n(2));
        let (waiting, fetched) = (hash_n(1), hash_n(2));

        announce(&handle, peer_a, &[(fetched, 0, 100)]);
        announce(&handle, peer_b, &[(fetched, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();
        // force the retrieval onto peer A for a deterministic scenario
        let assigned = *fetcher.fetching.get(&fetched).unwrap();
        let (dropped, fallback) = (assigned, if assigned == peer_a { peer_b } else { peer_a });

        // one more hash still waiting, announced only by the dropped peer
        announce(&handle, dropped, &[(waiting, 0, 100)]);
        drain(&mut fetcher);

        fetcher.on_peer_drop(dropped);

        assert!(!fetcher.waitlist.contains_key(&waiting));
        assert!(fetcher.waitslots.is_empty());
        assert!(!fetcher.requests.contains_key(&dropped));
        // the fetched hash fell back to the remaining announcer
        assert_eq!(fetcher.fetching.get(&fetched), Some(&fallback));
        assert_invariants(&fetcher);

        tokio::task::yield_now().await;
        assert_eq!(client.requests().last().unwrap(), &(fallback, vec![fetched]));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_drops_peer() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(9));
        client.fail_requests_for(peer);

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        // the dispatch task reports the failure as a drop event
        tokio::task::yield_now().await;
        drain(&mut fetcher);

        assert!(fetcher.requests.is_empty());
        assert!(fetcher.fetching.is_empty());
        assert!(fetcher.announces.is_empty());
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_waiting_announcement_is_idempotent() {
        let (mut fetcher, handle, _pool, _client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(3));

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        let seq = fetcher.waitslots.get(&peer).unwrap().get(&hash).unwrap().seq;

        // the second announcement must not refresh the metadata or the seq
        announce(&handle, peer, &[(hash, 0, 999)]);
        drain(&mut fetcher);

        let slot = fetcher.waitslots.get(&peer).unwrap().get(&hash).unwrap();
        assert_eq!(slot.seq, seq);
        assert_eq!(slot.meta.size, 100);
        assert_eq!(fetcher.waitlist.get(&hash).unwrap().len(), 1);
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_preserves_arrival_order() {
        let (mut fetcher, handle, _pool, _client) = new_fetcher(Default::default());
        let peer = peer_n(1);
        let (h5, h2, h9) = (hash_n(5), hash_n(2), hash_n(9));

        announce(&handle, peer, &[(h5, 0, 100), (h2, 0, 100), (h9, 0, 100)]);
        drain(&mut fetcher);
        let seqs: Vec<u64> = [h5, h2, h9]
            .iter()
            .map(|h| fetcher.waitslots.get(&peer).unwrap().get(h).unwrap().seq)
            .collect();
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));

        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        // seq survived the promotion, so the request is in announce order
        assert_eq!(fetcher.requests.get(&peer).unwrap().hashes, vec![h5, h2, h9]);
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn request_packing_respects_count_limit() {
        let config = TxFetcherConfig { max_hashes_per_request: 2, ..Default::default() };
        let (mut fetcher, handle, _pool, _client) = new_fetcher(config);
        let peer = peer_n(1);

        let batch: Vec<(TxHash, u8, u32)> = (1..=4).map(|i| (hash_n(i), 0, 100)).collect();
        announce(&handle, peer, &batch);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        assert_eq!(fetcher.requests.get(&peer).unwrap().hashes, vec![hash_n(1), hash_n(2)]);
        // the rest stays queued for the next round
        assert!(fetcher.announced.contains_key(&hash_n(3)));
        assert!(fetcher.announced.contains_key(&hash_n(4)));
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn request_packing_respects_byte_limit() {
        let config = TxFetcherConfig { max_announced_bytes_per_request: 250, ..Default::default() };
        let (mut fetcher, handle, _pool, _client) = new_fetcher(config);
        let peer = peer_n(1);

        let batch: Vec<(TxHash, u8, u32)> = (1..=4).map(|i| (hash_n(i), 0, 100)).collect();
        announce(&handle, peer, &batch);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        // the entry crossing the budget is still included, then packing stops
        assert_eq!(
            fetcher.requests.get(&peer).unwrap().hashes,
            vec![hash_n(1), hash_n(2), hash_n(3)]
        );
        assert!(fetcher.announced.contains_key(&hash_n(4)));
        assert_invariants(&fetcher);
    }

    #[tokio::test(start_paused = true)]
    async fn blob_announcement_skips_broadcast_wait() {
        let (mut fetcher, handle, _pool, client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(0xB1));

        announce(&handle, peer, &[(hash, BLOB_TX_TYPE_ID, 131072)]);
        drain(&mut fetcher);

        // already eligible without advancing the clock
        fetcher.on_wait_expired();
        assert_eq!(fetcher.fetching.get(&hash), Some(&peer));
        assert_invariants(&fetcher);

        tokio::task::yield_now().await;
        assert_eq!(client.requests(), vec![(peer, vec![hash])]);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_known_hash_is_filtered_before_the_loop() {
        let (mut fetcher, handle, pool, _client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(0xF0));
        pool.insert(hash);

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        assert!(fetcher.waitlist.is_empty());
        assert!(fetcher.waitslots.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn underpriced_reject_blocks_reannouncement() {
        let (mut fetcher, handle, pool, _client) = new_fetcher(Default::default());
        let (peer, hash) = (peer_n(1), hash_n(0xF1));
        pool.reject_with(hash, PoolImportError::Underpriced);

        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        time::advance(Duration::from_millis(500)).await;
        fetcher.on_wait_expired();

        handle.enqueue(peer, vec![PooledTransaction::new(hash, 0, 100)], true).await.unwrap();
        drain(&mut fetcher);
        assert!(fetcher.fetching.is_empty());
        assert!(fetcher.requests.is_empty());

        // a new announcement of the same hash dies in the pre-filter
        announce(&handle, peer, &[(hash, 0, 100)]);
        drain(&mut fetcher);
        assert!(fetcher.waitlist.is_empty());
        assert_invariants(&fetcher);
    }
}
