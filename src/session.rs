//! Client session: owns the group and metadata relay connections, the key
//! pair and every piece of observable state.
//!
//! A [`Session`] is cheap to clone; clones share the same state. Frame
//! handlers hold a weak reference so dropping the last clone tears the
//! connections down.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    error::{Error, Result},
    event::{
        unix_now, Event, Tag, KIND_CHAT_MESSAGE, KIND_GROUP_METADATA, KIND_JOIN_REQUEST,
        KIND_LEAVE_REQUEST, KIND_USER_METADATA,
    },
    keys::KeyPair,
    membership::MembershipSync,
    message::{Filter, RelayMessage},
    model::{filter_channel, GroupMessage, GroupMetadata, UserMetadata, GENERAL_CHANNEL},
    observable::Observable,
    relay::{ConnectionState, RelayConnection},
    store::{KeyValueStore, CURRENT_RELAY_URL, JOINED_GROUPS_PREFIX, PRIVATE_KEY},
    transport::Transport,
};

/// Messages per group, sorted by `created_at`.
pub type MessageMap = HashMap<String, Vec<GroupMessage>>;

struct Inner {
    settings: Settings,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    keys: RwLock<Option<KeyPair>>,
    group_relay: RwLock<Option<Arc<RelayConnection>>>,
    metadata_relay: RwLock<Option<Arc<RelayConnection>>>,
    metadata_connect: tokio::sync::Mutex<()>,
    metadata_index: AtomicUsize,
    connecting: AtomicBool,
    subscriptions: AtomicU64,
    pending_profiles: Mutex<HashSet<String>>,
    membership: MembershipSync,
    connection_state: Arc<Observable<ConnectionState>>,
    current_relay: Observable<String>,
    groups: Observable<Vec<GroupMetadata>>,
    messages: Observable<MessageMap>,
    profiles: Observable<HashMap<String, UserMetadata>>,
    logged_in: Observable<bool>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One signed-in (or anonymous) client.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("current_relay", &self.inner.current_relay.get())
            .field("logged_in", &self.inner.logged_in.get())
            .finish()
    }
}

impl Session {
    pub fn new(
        settings: Settings,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let membership = MembershipSync::new(settings.membership_timeout, settings.membership_poll);
        let current_relay = Observable::new(settings.group_relay.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                transport,
                keys: RwLock::new(None),
                group_relay: RwLock::new(None),
                metadata_relay: RwLock::new(None),
                metadata_connect: tokio::sync::Mutex::new(()),
                metadata_index: AtomicUsize::new(0),
                connecting: AtomicBool::new(false),
                subscriptions: AtomicU64::new(0),
                pending_profiles: Mutex::new(HashSet::new()),
                membership,
                connection_state: Arc::new(Observable::default()),
                current_relay,
                groups: Observable::default(),
                messages: Observable::default(),
                profiles: Observable::default(),
                logged_in: Observable::new(false),
            }),
        }
    }

    /// Status of the group relay connection.
    pub fn connection_state(&self) -> &Observable<ConnectionState> {
        &self.inner.connection_state
    }

    pub fn current_relay(&self) -> &Observable<String> {
        &self.inner.current_relay
    }

    pub fn current_relay_url(&self) -> String {
        self.inner.current_relay.get()
    }

    /// Discovered groups, first metadata per id wins.
    pub fn groups(&self) -> &Observable<Vec<GroupMetadata>> {
        &self.inner.groups
    }

    pub fn messages(&self) -> &Observable<MessageMap> {
        &self.inner.messages
    }

    /// Groups joined on the active relay.
    pub fn joined_groups(&self) -> &Observable<BTreeSet<String>> {
        self.inner.membership.joined()
    }

    pub fn profiles(&self) -> &Observable<HashMap<String, UserMetadata>> {
        &self.inner.profiles
    }

    pub fn logged_in(&self) -> &Observable<bool> {
        &self.inner.logged_in
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.logged_in.get()
    }

    pub fn membership(&self) -> &MembershipSync {
        &self.inner.membership
    }

    pub fn public_key(&self) -> Option<String> {
        read(&self.inner.keys).as_ref().map(KeyPair::public_key_hex)
    }

    pub fn private_key_hex(&self) -> Option<String> {
        read(&self.inner.keys).as_ref().map(KeyPair::private_key_hex)
    }

    pub fn messages_for_group(&self, group_id: &str) -> Vec<GroupMessage> {
        self.inner
            .messages
            .with(|m| m.get(group_id).cloned().unwrap_or_default())
    }

    pub fn messages_for_channel(&self, group_id: &str, channel: &str) -> Vec<GroupMessage> {
        self.inner.messages.with(|m| {
            m.get(group_id)
                .map(|list| filter_channel(list, channel).cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn is_group_joined(&self, group_id: &str) -> bool {
        self.inner.membership.is_joined(group_id)
    }

    /// URL of the connected metadata relay, if any.
    pub fn metadata_relay_url(&self) -> Option<String> {
        self.metadata_conn().map(|c| c.url().to_string())
    }

    fn keys(&self) -> Option<KeyPair> {
        read(&self.inner.keys).clone()
    }

    fn group_conn(&self) -> Option<Arc<RelayConnection>> {
        read(&self.inner.group_relay).clone()
    }

    fn metadata_conn(&self) -> Option<Arc<RelayConnection>> {
        read(&self.inner.metadata_relay).clone()
    }

    fn next_sub_id(&self, prefix: &str) -> String {
        let n = self.inner.subscriptions.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{}-{n}", unix_now())
    }

    /// Restore the persisted relay and credentials, then go online when a
    /// key was stored.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        self.restore_relay();
        let Some(saved) = inner.store.get(PRIVATE_KEY) else {
            return Ok(());
        };
        match KeyPair::from_private_key_hex(saved.trim()) {
            Ok(keys) => {
                *write(&inner.keys) = Some(keys);
                inner.logged_in.set(true);
                let active = inner.current_relay.get();
                inner.membership.reset_for_relay(&active, &*inner.store);
                info!(
                    "restored credentials with {} joined group(s)",
                    inner.membership.local_view().len()
                );
                self.go_online().await;
            }
            Err(e) => {
                warn!("discarding unusable stored key: {e}");
                inner.store.delete(PRIVATE_KEY)?;
            }
        }
        Ok(())
    }

    /// Adopt the persisted active relay URL, if any.
    pub fn restore_relay(&self) -> Option<String> {
        let url = self.inner.store.get(CURRENT_RELAY_URL)?;
        info!("restored relay {url}");
        self.inner.current_relay.set(url.clone());
        Some(url)
    }

    /// Close both relays; persisted state is left alone.
    pub fn teardown(&self) {
        self.disconnect();
        if let Some(conn) = write(&self.inner.metadata_relay).take() {
            conn.disconnect();
        }
    }

    async fn go_online(&self) {
        if let Err(e) = self.connect().await {
            warn!("group relay unavailable: {e}");
        }
        match self.connect_metadata_relay().await {
            Ok(()) => {
                if let Err(e) = self.reconcile_membership().await {
                    warn!("membership reconciliation failed: {e}");
                }
            }
            Err(e) => warn!("no metadata relay available: {e}"),
        }
    }

    /// Open the active group relay and request its group list.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.connecting.swap(true, Ordering::SeqCst) {
            warn!("already connecting");
            return Ok(());
        }
        if let Some(stale) = self.group_conn() {
            if matches!(
                stale.state(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                inner.connecting.store(false, Ordering::SeqCst);
                warn!("already connected to {}", stale.url());
                return Ok(());
            }
            debug!("dropping closed connection to {}", stale.url());
            stale.disconnect();
            let mut slot = write(&inner.group_relay);
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &stale)) {
                *slot = None;
            }
        }
        let url = inner.current_relay.get();
        let conn = Arc::new(RelayConnection::with_state(
            url.clone(),
            inner.transport.clone(),
            inner.connection_state.clone(),
        ));
        *write(&inner.group_relay) = Some(conn.clone());
        let result = conn.connect(self.group_handler()).await;
        inner.connecting.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("session connected to {url}");
                if let Err(e) = self.request_groups() {
                    warn!("group request failed: {e}");
                }
                Ok(())
            }
            Err(e) => {
                let mut slot = write(&inner.group_relay);
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                    *slot = None;
                }
                Err(e)
            }
        }
    }

    /// Connect the metadata relay, advancing through the configured list on
    /// failure. After the last entry fails the next attempt starts over.
    pub async fn connect_metadata_relay(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.metadata_connect.lock().await;
        if self.metadata_conn().is_some_and(|c| c.is_connected()) {
            return Ok(());
        }
        let relays = &inner.settings.metadata_relays;
        if relays.is_empty() {
            return Err(Error::Transport("no metadata relays configured".into()));
        }
        loop {
            let index = inner.metadata_index.load(Ordering::SeqCst).min(relays.len() - 1);
            let url = &relays[index];
            info!("connecting to metadata relay {url}");
            let conn = Arc::new(RelayConnection::new(url.clone(), inner.transport.clone()));
            match conn.connect(self.metadata_handler()).await {
                Ok(()) => {
                    let old = write(&inner.metadata_relay).replace(conn);
                    if let Some(old) = old {
                        old.disconnect();
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("metadata relay {url} failed: {e}");
                    if index + 1 < relays.len() {
                        inner.metadata_index.store(index + 1, Ordering::SeqCst);
                    } else {
                        inner.metadata_index.store(0, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Fetch the membership record for the active relay and reconcile.
    pub async fn reconcile_membership(&self) -> Result<Option<Event>> {
        let inner = &self.inner;
        let keys = self.keys().ok_or(Error::NotLoggedIn)?;
        let conn = self.metadata_conn().ok_or(Error::NotConnected)?;
        if !inner.settings.metadata_settle.is_zero() {
            sleep(inner.settings.metadata_settle).await;
        }
        let active = inner.current_relay.get();
        inner
            .membership
            .load(&conn, &keys, &active, &*inner.store)
            .await
    }

    /// Persist the key, connect both relays and reconcile membership.
    ///
    /// Only a malformed key fails; relay problems are logged and reflected
    /// in [`Session::connection_state`].
    pub async fn login(&self, private_key_hex: &str) -> Result<()> {
        let inner = &self.inner;
        let keys = KeyPair::from_private_key_hex(private_key_hex.trim())?;
        inner.store.set(PRIVATE_KEY, &keys.private_key_hex())?;
        info!("logged in as {}", keys.public_key_hex());
        *write(&inner.keys) = Some(keys);
        inner.logged_in.set(true);
        let active = inner.current_relay.get();
        inner.membership.reset_for_relay(&active, &*inner.store);
        self.go_online().await;
        Ok(())
    }

    /// Drop both connections, the key pair and all persisted credentials.
    pub fn logout(&self) -> Result<()> {
        let inner = &self.inner;
        self.teardown();
        inner.store.delete(PRIVATE_KEY)?;
        inner.store.delete_by_prefix(JOINED_GROUPS_PREFIX)?;
        *write(&inner.keys) = None;
        inner.logged_in.set(false);
        inner.membership.clear();
        inner
            .pending_profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("logged out");
        Ok(())
    }

    /// Adopt another group relay and reconcile membership against it.
    pub async fn switch_relay(&self, url: &str) -> Result<()> {
        let inner = &self.inner;
        info!("switching to relay {url}");
        self.disconnect();
        inner.current_relay.set(url.to_string());
        inner.store.set(CURRENT_RELAY_URL, url)?;
        inner.membership.reset_for_relay(url, &*inner.store);
        if let Err(e) = self.connect().await {
            warn!("relay {url} unavailable: {e}");
        }
        if !self.is_logged_in() {
            return Ok(());
        }
        if let Err(e) = self.connect_metadata_relay().await {
            warn!("no metadata relay available: {e}");
            return Ok(());
        }
        if let Err(e) = self.reconcile_membership().await {
            warn!("membership reconciliation failed: {e}");
        }
        Ok(())
    }

    /// Close the group relay and forget its groups and messages.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        if let Some(conn) = write(&inner.group_relay).take() {
            conn.disconnect();
        }
        inner.connection_state.set(ConnectionState::Disconnected);
        inner.groups.set(Vec::new());
        inner.messages.set(MessageMap::new());
        inner.connecting.store(false, Ordering::SeqCst);
    }

    fn online(&self) -> Result<(Arc<RelayConnection>, KeyPair)> {
        let keys = self.keys().ok_or(Error::NotLoggedIn)?;
        let conn = self.group_conn().ok_or(Error::NotConnected)?;
        Ok((conn, keys))
    }

    /// Send a join request, record the membership and republish it.
    pub async fn join_group(&self, group_id: &str) -> Result<()> {
        let inner = &self.inner;
        let (conn, keys) = self.online()?;
        let event = Event::new(
            keys.public_key_hex(),
            unix_now(),
            KIND_JOIN_REQUEST,
            vec![Tag::new(["h", group_id])],
            "/join",
        )
        .sign(&keys)?;
        conn.publish(&event)?;
        let active = inner.current_relay.get();
        inner.membership.join_local(group_id, &active, &*inner.store);
        if let Err(e) = self.publish_membership() {
            warn!("joined {group_id} but could not publish kind:10009: {e}");
        }
        info!("joined group {group_id} on {active}");
        self.request_group_messages(group_id).await
    }

    /// Send a leave request, drop the membership and the group's messages.
    pub fn leave_group(&self, group_id: &str, reason: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        let (conn, keys) = self.online()?;
        let event = Event::new(
            keys.public_key_hex(),
            unix_now(),
            KIND_LEAVE_REQUEST,
            vec![Tag::new(["h", group_id])],
            reason.unwrap_or_default(),
        )
        .sign(&keys)?;
        conn.publish(&event)?;
        let active = inner.current_relay.get();
        inner.membership.leave_local(group_id, &active, &*inner.store);
        if let Err(e) = self.publish_membership() {
            warn!("left {group_id} but could not publish kind:10009: {e}");
        }
        inner.messages.update(|m| {
            m.remove(group_id);
        });
        info!("left group {group_id} on {active}");
        Ok(())
    }

    /// Republish the full membership record on the metadata relay.
    pub fn publish_membership(&self) -> Result<Event> {
        let inner = &self.inner;
        let keys = self.keys().ok_or(Error::NotLoggedIn)?;
        let conn = self.metadata_conn().ok_or(Error::NotConnected)?;
        let active = inner.current_relay.get();
        inner.membership.publish(&conn, &keys, &active)
    }

    /// Post a chat message. `general` (or no channel) omits the channel tag.
    pub fn send_message(
        &self,
        group_id: &str,
        content: &str,
        channel: Option<&str>,
    ) -> Result<Event> {
        let (conn, keys) = self.online()?;
        let mut tags = vec![Tag::new(["h", group_id])];
        if let Some(channel) = channel.filter(|c| *c != GENERAL_CHANNEL) {
            tags.push(Tag::new(["channel", channel]));
        }
        let event = Event::new(
            keys.public_key_hex(),
            unix_now(),
            KIND_CHAT_MESSAGE,
            tags,
            content,
        )
        .sign(&keys)?;
        conn.publish(&event)?;
        info!(
            "sent message to {group_id} ({})",
            channel.unwrap_or(GENERAL_CHANNEL)
        );
        Ok(event)
    }

    /// Ask the group relay for its group metadata.
    pub fn request_groups(&self) -> Result<()> {
        let conn = self.group_conn().ok_or(Error::NotConnected)?;
        conn.subscribe(
            &self.next_sub_id("groups"),
            vec![Filter::new().kinds([KIND_GROUP_METADATA])],
        )
    }

    /// Ask for the latest messages, joins and leaves of a group, connecting
    /// first when needed.
    pub async fn request_group_messages(&self, group_id: &str) -> Result<()> {
        let conn = match self.group_conn() {
            Some(conn) => conn,
            None => {
                debug!("not connected, connecting first");
                self.connect().await?;
                self.group_conn().ok_or(Error::NotConnected)?
            }
        };
        let filter = Filter::new()
            .kinds([KIND_CHAT_MESSAGE, KIND_JOIN_REQUEST, KIND_LEAVE_REQUEST])
            .groups([group_id])
            .limit(100);
        conn.subscribe(&self.next_sub_id("messages"), vec![filter])
    }

    /// Request profiles from the metadata relay. Pubkeys already requested
    /// and not yet answered are skipped.
    pub async fn request_user_metadata(&self, pubkeys: Vec<String>) -> Result<()> {
        let fresh: Vec<String> = {
            let mut pending = self
                .inner
                .pending_profiles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pubkeys
                .into_iter()
                .filter(|pk| pending.insert(pk.clone()))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        let result = self.send_profile_request(&fresh).await;
        if result.is_err() {
            let mut pending = self
                .inner
                .pending_profiles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for pk in &fresh {
                pending.remove(pk);
            }
        }
        result
    }

    async fn send_profile_request(&self, pubkeys: &[String]) -> Result<()> {
        let conn = match self.metadata_conn().filter(|c| c.is_connected()) {
            Some(conn) => conn,
            None => {
                debug!("metadata relay not connected, connecting now");
                self.connect_metadata_relay().await?;
                self.metadata_conn().ok_or(Error::NotConnected)?
            }
        };
        let filter = Filter::new()
            .kinds([KIND_USER_METADATA])
            .authors(pubkeys.iter().cloned());
        conn.subscribe(&self.next_sub_id("metadata"), vec![filter])?;
        debug!("requested metadata for {} user(s)", pubkeys.len());
        Ok(())
    }

    fn group_handler(&self) -> impl Fn(String) + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move |text| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_group_frame(&text);
            }
        }
    }

    fn metadata_handler(&self) -> impl Fn(String) + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move |text| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_metadata_frame(&text);
            }
        }
    }

    fn decode(&self, text: &str) -> Option<RelayMessage> {
        match RelayMessage::from_json(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!("dropping unparsable frame: {e}");
                None
            }
        }
    }

    fn accept(&self, event: &Event) -> bool {
        if self.inner.settings.verify_sig && !event.verify() {
            debug!("dropping event with bad id or signature: {:?}", event.id);
            return false;
        }
        true
    }

    fn log_status(&self, msg: &RelayMessage) {
        match msg {
            RelayMessage::Notice(notice) => info!("relay notice: {notice}"),
            RelayMessage::Ok {
                event_id,
                accepted: true,
                ..
            } => debug!("event {event_id} accepted"),
            RelayMessage::Ok {
                event_id, message, ..
            } => warn!("event {event_id} rejected: {message}"),
            RelayMessage::Eose(sub) => debug!("EOSE {sub}"),
            RelayMessage::Unknown(label) => debug!("ignoring {label} frame"),
            RelayMessage::Event { .. } => {}
        }
    }

    fn on_group_frame(&self, text: &str) {
        let Some(msg) = self.decode(text) else {
            return;
        };
        match msg {
            RelayMessage::Event { event, .. } => {
                if self.accept(&event) {
                    self.route_group_event(*event);
                }
            }
            other => self.log_status(&other),
        }
    }

    /// Group metadata, then profile, then message carrying an `h` tag.
    fn route_group_event(&self, event: Event) {
        let inner = &self.inner;
        if let Some(meta) = GroupMetadata::from_event(&event) {
            if meta.name.is_some() {
                inner.groups.update_if(|groups| {
                    if groups.iter().any(|g| g.id == meta.id) {
                        false
                    } else {
                        groups.push(meta);
                        true
                    }
                });
            }
            return;
        }
        if let Some((pubkey, meta)) = UserMetadata::from_event(&event) {
            self.store_profile(pubkey, meta);
            return;
        }
        let Some(message) = GroupMessage::from_event(&event) else {
            return;
        };
        let Some(group_id) = event.tag_value("h") else {
            debug!("dropping {} without group tag", message.label());
            return;
        };
        let author = message.pubkey.clone();
        let label = message.label();
        if self.insert_message(group_id, message) {
            debug!("added {label} to {group_id} from {author}");
        }
        if !inner.profiles.with(|p| p.contains_key(&author)) {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.request_user_metadata(vec![author]).await {
                    debug!("profile request failed: {e}");
                }
            });
        }
    }

    fn insert_message(&self, group_id: &str, message: GroupMessage) -> bool {
        self.inner.messages.update_if(|all| {
            let list = all.entry(group_id.to_string()).or_default();
            if list.iter().any(|m| m.id == message.id) {
                return false;
            }
            list.push(message);
            list.sort_by_key(|m| m.created_at);
            true
        })
    }

    fn store_profile(&self, pubkey: String, meta: UserMetadata) {
        debug!(
            "loaded metadata for {}",
            meta.label().unwrap_or(pubkey.as_str())
        );
        self.inner
            .pending_profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pubkey);
        self.inner.profiles.update(|p| {
            p.insert(pubkey, meta);
        });
    }

    fn on_metadata_frame(&self, text: &str) {
        let Some(msg) = self.decode(text) else {
            return;
        };
        if let RelayMessage::Event { event, .. } = &msg {
            if !self.accept(event) {
                return;
            }
        }
        if let Some(own) = self.public_key() {
            let active = self.inner.current_relay.get();
            if self
                .inner
                .membership
                .handle_frame(&msg, &own, &active, &*self.inner.store)
            {
                return;
            }
        }
        match msg {
            RelayMessage::Event { event, .. } => {
                if let Some((pubkey, meta)) = UserMetadata::from_event(&event) {
                    self.store_profile(pubkey, meta);
                }
            }
            other => self.log_status(&other),
        }
    }
}
