//! Joined-groups reconciliation across group relays.
//!
//! The author's kind-10009 record lists every `(group, relay)` pair the user
//! belongs to. Relays only keep the newest copy, so every republish is built
//! from the full federated view and never from the active relay alone.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    event::{unix_now, Event, Tag, KIND_JOINED_GROUPS},
    keys::KeyPair,
    message::{Filter, RelayMessage},
    observable::Observable,
    relay::RelayConnection,
    store::{joined_groups_key, KeyValueStore},
};

/// Relay URL -> group ids joined there.
pub type FederatedView = BTreeMap<String, BTreeSet<String>>;

/// Progress of one membership request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Requesting(String),
    Received,
    TimedOut,
    Reconciled,
}

#[derive(Debug, Default)]
struct SyncState {
    phase: Phase,
    active_sub: Option<String>,
    eose_received: bool,
    record_received: bool,
    federated: FederatedView,
}

/// Keeps the local and federated membership views and the record exchange.
#[derive(Debug)]
pub struct MembershipSync {
    state: Mutex<SyncState>,
    joined: Observable<BTreeSet<String>>,
    timeout: Duration,
    poll: Duration,
    requests: AtomicU64,
}

impl MembershipSync {
    /// `timeout` bounds the wait for the record, checked every `poll`.
    pub fn new(timeout: Duration, poll: Duration) -> Self {
        Self {
            state: Mutex::new(SyncState::default()),
            joined: Observable::default(),
            timeout,
            poll,
            requests: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Groups joined on the active relay.
    pub fn joined(&self) -> &Observable<BTreeSet<String>> {
        &self.joined
    }

    pub fn local_view(&self) -> BTreeSet<String> {
        self.joined.get()
    }

    pub fn is_joined(&self, group_id: &str) -> bool {
        self.joined.with(|g| g.contains(group_id))
    }

    pub fn federated(&self) -> FederatedView {
        self.lock().federated.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    /// Start a new request and return its subscription id.
    pub fn begin_request(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let n = self.requests.fetch_add(1, Ordering::Relaxed);
        let sub_id = format!("joined-groups-{millis}-{n}");
        let mut st = self.lock();
        st.phase = Phase::Requesting(sub_id.clone());
        st.active_sub = Some(sub_id.clone());
        st.eose_received = false;
        st.record_received = false;
        sub_id
    }

    /// Mark end of stored events for the active request.
    pub fn on_eose(&self, subscription_id: &str) -> bool {
        let mut st = self.lock();
        if st.active_sub.as_deref() == Some(subscription_id) {
            st.eose_received = true;
            debug!("EOSE for joined-groups subscription {subscription_id}");
            true
        } else {
            false
        }
    }

    /// Rebuild the federated view from a membership record.
    ///
    /// Only accepted until the matching subscription is closed. The view is
    /// replaced, not merged, and the active relay's projection is persisted.
    pub fn on_record(
        &self,
        subscription_id: &str,
        event: &Event,
        active_relay: &str,
        store: &dyn KeyValueStore,
    ) -> bool {
        if event.kind != KIND_JOINED_GROUPS {
            return false;
        }
        let projection = {
            let mut st = self.lock();
            if st.active_sub.as_deref() != Some(subscription_id) {
                debug!("ignoring kind:10009 outside subscription {subscription_id}");
                return false;
            }
            st.federated = parse_membership_tags(event, active_relay);
            st.record_received = true;
            st.phase = Phase::Received;
            for (relay, groups) in &st.federated {
                debug!("{relay}: {} group(s)", groups.len());
            }
            st.federated.get(active_relay).cloned().unwrap_or_default()
        };
        if let Err(e) = store.set_set(&joined_groups_key(active_relay), &projection) {
            warn!("failed to persist joined groups: {e}");
        }
        info!(
            "loaded kind:10009 with {} group(s) for {active_relay}",
            projection.len()
        );
        self.joined.set(projection);
        true
    }

    /// Feed a decoded metadata-relay frame. Returns `true` when consumed.
    pub fn handle_frame(
        &self,
        msg: &RelayMessage,
        own_pubkey: &str,
        active_relay: &str,
        store: &dyn KeyValueStore,
    ) -> bool {
        match msg {
            RelayMessage::Eose(sub) => self.on_eose(sub),
            RelayMessage::Event {
                subscription_id,
                event,
            } if event.kind == KIND_JOINED_GROUPS => {
                if event.pubkey != own_pubkey {
                    debug!("ignoring kind:10009 from {}", event.pubkey);
                    return true;
                }
                self.on_record(subscription_id, event, active_relay, store);
                true
            }
            _ => false,
        }
    }

    /// Request the membership record and reconcile.
    ///
    /// Waits until both EOSE and the record arrived, or until the timeout.
    /// Without a record, a non-empty persisted set for the active relay seeds
    /// both views and is republished; that event is returned.
    pub async fn load(
        &self,
        conn: &RelayConnection,
        keys: &KeyPair,
        active_relay: &str,
        store: &dyn KeyValueStore,
    ) -> Result<Option<Event>> {
        let sub_id = self.begin_request();
        let filter = Filter::new()
            .kinds([KIND_JOINED_GROUPS])
            .authors([keys.public_key_hex()])
            .limit(1);
        if let Err(e) = conn.subscribe(&sub_id, vec![filter]) {
            let mut st = self.lock();
            st.phase = Phase::Idle;
            st.active_sub = None;
            return Err(e);
        }
        info!("requesting kind:10009 for {active_relay} ({sub_id})");

        let deadline = Instant::now() + self.timeout;
        let step = self.poll.max(Duration::from_millis(1));
        loop {
            {
                let st = self.lock();
                if st.eose_received && st.record_received {
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(step.min(deadline - now)).await;
        }

        if let Err(e) = conn.close(&sub_id) {
            warn!("failed to close {sub_id}: {e}");
        }

        let received = {
            let mut st = self.lock();
            st.active_sub = None;
            if !st.record_received {
                st.phase = Phase::TimedOut;
            }
            st.record_received
        };
        if received {
            self.lock().phase = Phase::Reconciled;
            return Ok(None);
        }

        warn!("no kind:10009 found for {active_relay}");
        let local = store.get_set(&joined_groups_key(active_relay));
        if local.is_empty() {
            self.lock().phase = Phase::Reconciled;
            return Ok(None);
        }
        info!("publishing {} local group(s) as kind:10009", local.len());
        self.joined.set(local.clone());
        self.lock().federated.insert(active_relay.to_string(), local);
        let published = self.publish(conn, keys, active_relay);
        self.lock().phase = Phase::Reconciled;
        published.map(Some)
    }

    /// Merge the local view into the federated view and publish the full record.
    pub fn publish(
        &self,
        conn: &RelayConnection,
        keys: &KeyPair,
        active_relay: &str,
    ) -> Result<Event> {
        let local = self.joined.get();
        let tags = {
            let mut st = self.lock();
            st.federated.insert(active_relay.to_string(), local.clone());
            membership_tags(&st.federated)
        };
        let event = Event::new(
            keys.public_key_hex(),
            unix_now(),
            KIND_JOINED_GROUPS,
            tags,
            "",
        )
        .sign(keys)?;
        conn.publish(&event)?;
        info!(
            "published kind:10009 with {} group(s), {} on {active_relay}",
            event.tags.len(),
            local.len()
        );
        Ok(event)
    }

    /// Add a group to the local view and persist it.
    pub fn join_local(&self, group_id: &str, active_relay: &str, store: &dyn KeyValueStore) {
        self.joined.update(|g| {
            g.insert(group_id.to_string());
        });
        self.persist(active_relay, store);
    }

    /// Remove a group from the local view and persist it.
    pub fn leave_local(&self, group_id: &str, active_relay: &str, store: &dyn KeyValueStore) {
        self.joined.update(|g| {
            g.remove(group_id);
        });
        self.persist(active_relay, store);
    }

    fn persist(&self, active_relay: &str, store: &dyn KeyValueStore) {
        let local = self.joined.get();
        if let Err(e) = store.set_set(&joined_groups_key(active_relay), &local) {
            warn!("failed to persist joined groups: {e}");
        }
    }

    /// Adopt the local view of a newly active relay: its federated entry when
    /// one is known, else the persisted set. The federated view is kept.
    pub fn reset_for_relay(&self, active_relay: &str, store: &dyn KeyValueStore) {
        let known = {
            let mut st = self.lock();
            st.phase = Phase::Idle;
            st.active_sub = None;
            st.eose_received = false;
            st.record_received = false;
            st.federated.get(active_relay).cloned()
        };
        let local = match known {
            Some(groups) => {
                if let Err(e) = store.set_set(&joined_groups_key(active_relay), &groups) {
                    warn!("failed to persist joined groups: {e}");
                }
                groups
            }
            None => store.get_set(&joined_groups_key(active_relay)),
        };
        debug!("{} local group(s) for {active_relay}", local.len());
        self.joined.set(local);
    }

    /// Forget everything, as on logout.
    pub fn clear(&self) {
        *self.lock() = SyncState::default();
        self.joined.set(BTreeSet::new());
    }
}

/// Read `["group", id, relay?]` tags. Tags without a relay belong to `active_relay`.
pub fn parse_membership_tags(event: &Event, active_relay: &str) -> FederatedView {
    let mut view = FederatedView::new();
    for tag in event.tags_named("group") {
        let Some(group_id) = tag.value().filter(|g| !g.is_empty()) else {
            continue;
        };
        let relay = tag.get(2).filter(|r| !r.is_empty()).unwrap_or(active_relay);
        view.entry(relay.to_string())
            .or_default()
            .insert(group_id.to_string());
    }
    view
}

/// One `["group", id, relay]` tag per pair, ordered by relay then group.
pub fn membership_tags(view: &FederatedView) -> Vec<Tag> {
    view.iter()
        .flat_map(|(relay, groups)| {
            groups
                .iter()
                .map(move |g| Tag::new(["group", g.as_str(), relay.as_str()]))
        })
        .collect()
}
