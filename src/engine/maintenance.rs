//! Table population and upkeep: bootstrap, the fill lookup, liveness checks, bucket refreshes and
//! persistence.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    net::SocketAddr,
    path::Path,
    time::Duration,
};

use time::OffsetDateTime;
use tracing::{debug, info, trace, warn};

use super::{pending::Purpose, DhtEngine, FillState, Lookup};
use crate::{
    core::{
        contact::Contact,
        id::NodeId,
        message::{Query, Response},
        routing_table::Restored,
        traits::Transport,
    },
    error::DhtError,
};

// How many of the contacts nearest a random target are asked during a refresh or a replacement
// probe.
const PROBE_FANOUT: usize = 3;

fn due(last: Option<OffsetDateTime>, every: Duration, now: OffsetDateTime) -> bool {
    last.map_or(true, |last| last + every <= now)
}

impl<T: Transport> DhtEngine<T> {
    pub(super) fn maintain(&mut self, now: OffsetDateTime) {
        if !self.bootstrapped && due(self.timers.bootstrap, self.config.bootstrap_retry, now) {
            self.timers.bootstrap = Some(now);
            self.bootstrap(now);
        }

        if matches!(self.fill, FillState::Idle) && (self.bootstrapped || self.restored > 0) {
            self.start_fill(now);
        } else if matches!(&self.fill, FillState::Running(lookup) if lookup.in_flight == 0) {
            self.advance_fill(now);
        }

        if due(self.timers.liveness, self.config.liveness_interval, now) {
            self.timers.liveness = Some(now);
            self.check_liveness(now);
            self.refresh_buckets(now);
        }

        if self.config.snapshot_path.is_some()
            && due(self.timers.persist, self.config.persist_interval, now)
        {
            self.timers.persist = Some(now);
            if let Err(e) = self.save() {
                warn!("failed to persist the routing table: {e}");
            }
        }
    }

    /// Pings every bootstrap node that isn't already being pinged.
    pub fn bootstrap(&mut self, now: OffsetDateTime) {
        let in_progress: HashSet<SocketAddr> = self
            .registry
            .continuations()
            .filter(|pending| matches!(pending.purpose, Purpose::Bootstrap))
            .map(|pending| pending.addr)
            .collect();

        let targets: Vec<SocketAddr> = self
            .bootstrap_nodes
            .iter()
            .filter(|addr| !in_progress.contains(addr))
            .copied()
            .collect();

        if !targets.is_empty() {
            debug!("pinging {} bootstrap nodes", targets.len());
        }

        for addr in targets {
            self.send_query(addr, Query::Ping, Purpose::Bootstrap, now);
        }
    }

    pub(super) fn on_bootstrap_reply(&mut self, addr: SocketAddr, reply: Result<Response, DhtError>) {
        // The responder was inserted when the reply was dispatched.
        match reply.and_then(|response| response.node_id()) {
            Ok(id) => {
                if !self.bootstrapped {
                    info!("bootstrapped via {addr} ({id})");
                }
                self.bootstrapped = true;
            }
            Err(e) => debug!("bootstrap node {addr} failed: {e}"),
        }
    }

    fn start_fill(&mut self, now: OffsetDateTime) {
        if self.restored > self.config.fill_skip_threshold {
            info!(
                "skipping fill, {} contacts were restored from the snapshot",
                self.restored
            );
            self.fill = FillState::Finished;
            return;
        }

        debug!("starting fill from {} contacts", self.table.size());
        self.fill = FillState::Running(Lookup::default());
        self.advance_fill(now);
    }

    // Queries the nearest contacts to the local id that haven't been asked yet, finishes the
    // lookup once nothing is left to ask and no reply is outstanding.
    fn advance_fill(&mut self, now: OffsetDateTime) {
        let local_id = self.local_id();

        let candidates: Vec<Contact> = match &mut self.fill {
            FillState::Running(lookup) if !lookup.advancing => {
                lookup.advancing = true;
                self.table
                    .find_nearest(&local_id, self.config.fill_width)
                    .into_iter()
                    .filter(|contact| !lookup.queried.contains(&contact.id))
                    .collect()
            }
            _ => return,
        };

        for contact in candidates {
            if let FillState::Running(lookup) = &mut self.fill {
                lookup.queried.insert(contact.id);
                lookup.in_flight += 1;
            }

            self.send_query(
                contact.addr,
                Query::FindNode { target: local_id },
                Purpose::Fill,
                now,
            );
        }

        let converged = match &mut self.fill {
            FillState::Running(lookup) => {
                lookup.advancing = false;
                lookup.in_flight == 0
            }
            _ => false,
        };

        if converged {
            self.finish_fill();
        }
    }

    fn finish_fill(&mut self) {
        let queried = match &self.fill {
            FillState::Running(lookup) => lookup.queried.len(),
            _ => 0,
        };
        self.fill = FillState::Finished;

        info!(
            "fill converged after querying {queried} nodes, {} contacts known",
            self.table.size()
        );

        if let Err(e) = self.save() {
            warn!("failed to persist the routing table: {e}");
        }
    }

    pub(super) fn on_fill_reply(
        &mut self,
        addr: SocketAddr,
        reply: Result<Response, DhtError>,
        now: OffsetDateTime,
    ) {
        let order = self.config.port_order;

        // A failed branch contributes nothing, the lookup carries on with the others.
        match reply.and_then(|response| response.contacts(order)) {
            Ok(contacts) => {
                let learned = self.learn(&contacts);
                trace!("fill query to {addr} learned {learned} contacts");
            }
            Err(e) => debug!("fill query to {addr} failed: {e}"),
        }

        if let FillState::Running(lookup) = &mut self.fill {
            lookup.in_flight = lookup.in_flight.saturating_sub(1);
        }

        self.advance_fill(now);
    }

    // Pings contacts that were never confirmed or went quiet and probes for replacements of those
    // silent for too long.
    fn check_liveness(&mut self, now: OffsetDateTime) {
        let (stale_after, evict_after) = (self.config.stale_after, self.config.evict_after);

        let pinging: HashSet<NodeId> = self
            .registry
            .continuations()
            .filter_map(|pending| match pending.purpose {
                Purpose::Liveness(id) => Some(id),
                _ => None,
            })
            .collect();

        let mut ping = Vec::new();
        let mut replace = Vec::new();
        for contact in self.table.contacts() {
            match contact.last_seen {
                Some(seen) if seen + stale_after > now => continue,
                Some(seen) if seen + evict_after <= now => replace.push(*contact),
                _ => {}
            }

            if !pinging.contains(&contact.id) {
                ping.push(*contact);
            }
        }

        if !ping.is_empty() || !replace.is_empty() {
            debug!(
                "pinging {} contacts, probing replacements for {}",
                ping.len(),
                replace.len()
            );
        }

        for contact in ping {
            self.send_query(
                contact.addr,
                Query::Ping,
                Purpose::Liveness(contact.id),
                now,
            );
        }

        for stale in replace {
            self.probe_replacement(&stale, now);
        }
    }

    pub(super) fn on_liveness_reply(&mut self, id: NodeId, reply: Result<Response, DhtError>) {
        match reply.and_then(|response| response.node_id()) {
            // Confirmed when the reply was dispatched.
            Ok(responder) if responder == id => return,
            Ok(responder) => debug!("expected {id} to answer, got {responder}"),
            // The ping never left, the contact isn't to blame.
            Err(e @ (DhtError::TooManyPending | DhtError::Transport(_))) => {
                trace!("couldn't ping {id}: {e}");
                return;
            }
            Err(e) => trace!("liveness ping to {id} failed: {e}"),
        }

        let max_failures = self.config.max_failures;
        let Some(contact) = self.table.get_mut(&id) else {
            return;
        };

        contact.failures = contact.failures.saturating_add(1);
        if contact.failures >= max_failures {
            let failures = contact.failures;
            self.table.delete(|contact| contact.id == id);
            debug!("evicted {id} after {failures} failed pings");
        }
    }

    // Looks up a random id in the stale contact's bucket, the replies stand in for it.
    fn probe_replacement(&mut self, stale: &Contact, now: OffsetDateTime) {
        let Some(index) = self.table.bucket_index(&stale.id) else {
            return;
        };
        let target = self.table.buckets()[index].random_id(&mut self.rng);

        let helpers: Vec<Contact> = self
            .table
            .find_nearest(&target, PROBE_FANOUT + 1)
            .into_iter()
            .filter(|contact| contact.id != stale.id)
            .take(PROBE_FANOUT)
            .collect();

        for helper in helpers {
            self.send_query(
                helper.addr,
                Query::FindNode { target },
                Purpose::Replacement { stale: stale.id },
                now,
            );
        }
    }

    pub(super) fn on_replacement_reply(
        &mut self,
        stale: NodeId,
        addr: SocketAddr,
        reply: Result<Response, DhtError>,
        now: OffsetDateTime,
    ) {
        let contacts = match reply.and_then(|response| response.contacts(self.config.port_order)) {
            Ok(contacts) => contacts,
            Err(e) => {
                debug!("replacement probe via {addr} failed: {e}");
                return;
            }
        };

        let evict_after = self.config.evict_after;
        let still_stale = self.table.get(&stale).map(|contact| match contact.last_seen {
            Some(seen) => seen + evict_after <= now,
            None => true,
        });

        let newcomers = contacts
            .iter()
            .any(|contact| contact.id != stale && self.table.get(&contact.id).is_none());

        if still_stale == Some(true) && newcomers {
            self.table.delete(|contact| contact.id == stale);
            debug!("replacing stale contact {stale}");
        }

        let learned = self.learn(&contacts);
        trace!("replacement probe via {addr} learned {learned} contacts");
    }

    // Looks up a random id in every bucket that saw no activity for a while.
    fn refresh_buckets(&mut self, now: OffsetDateTime) {
        if self.table.is_empty() {
            return;
        }

        let refresh_after = self.config.bucket_refresh;
        let mut targets = Vec::new();
        for bucket in self.table.buckets_mut() {
            match bucket.last_refreshed() {
                Some(last) if last + refresh_after > now => {}
                Some(_) => {
                    bucket.mark_refreshed(now);
                    targets.push(bucket.random_id(&mut self.rng));
                }
                // A bucket nothing happened in yet starts idling now.
                None => bucket.mark_refreshed(now),
            }
        }

        if !targets.is_empty() {
            debug!("refreshing {} idle buckets", targets.len());
        }

        for target in targets {
            for helper in self.table.find_nearest(&target, PROBE_FANOUT) {
                self.send_query(helper.addr, Query::FindNode { target }, Purpose::Refresh, now);
            }
        }
    }

    /// Writes the routing table to the configured snapshot path, a no-op without one.
    ///
    /// The snapshot is written to a temporary sibling first and renamed over the previous one.
    pub fn save(&self) -> Result<(), DhtError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        let file = File::create(&tmp)?;
        self.table.persist(BufWriter::new(file))?;
        fs::rename(&tmp, path)?;

        debug!("persisted {} contacts to {}", self.table.size(), path.display());

        Ok(())
    }

    /// Restores the routing table from the configured snapshot path.
    ///
    /// A missing or empty snapshot restores nothing. Enough restored contacts make the fill
    /// lookup unnecessary.
    pub fn load(&mut self) -> Result<Restored, DhtError> {
        let Some(path) = self.config.snapshot_path.clone() else {
            return Ok(Restored::default());
        };

        let restored = self.load_from(&path)?;
        self.restored += restored.inserted;

        if restored.inserted > 0 {
            info!(
                "restored {} contacts from {}",
                restored.inserted,
                path.display()
            );
        }

        Ok(restored)
    }

    fn load_from(&mut self, path: &Path) -> Result<Restored, DhtError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Restored::default()),
            Err(e) => return Err(e.into()),
        };

        self.table.restore(BufReader::new(file))
    }
}
