//! The item transfer engine.
//!
//! [`ItemTransfer`] owns the session table. Every public operation is keyed
//! by `(system, category)` and at most one session may exist per key. Each
//! session has one deadline task on the shared [`Scheduler`]; the task holds
//! only a weak reference to the engine and the id of the session that armed
//! it, so a late fire after the session ended does nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::session::{Session, Step};
use super::{
    ItemsCallback, ProgressCallback, ResultCallback, SessionKey, SessionSnapshot,
    TransferConfig, TransferKind, WireMessage,
};
use crate::core::{Category, Item, SystemId, TransferError};
use crate::link::Link;
use crate::scheduler::{Cookie, Scheduler};

type SessionTable<I> = HashMap<SessionKey, Session<I>>;

struct Inner<I: Item, L: Link<I>> {
    link: L,
    scheduler: Arc<Scheduler>,
    config: TransferConfig,
    sessions: Mutex<SessionTable<I>>,
    next_id: AtomicU64,
}

/// Reliable bulk transfer of sequence-numbered items.
///
/// Cheap to clone; clones share sessions. When the last clone is dropped,
/// every live session resolves with [`TransferError::Cancelled`].
///
/// # Threading
///
/// The `_async` operations return immediately and deliver their result
/// through a callback, invoked from whichever thread drives the scheduler or
/// calls [`process_message`](Self::process_message). The blocking operations
/// wait on that callback and MUST NOT be called from the pump. Called from
/// inside a tokio runtime they return [`TransferError::Unknown`] without
/// starting anything.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use item_transfer::prelude::*;
///
/// let scheduler = Arc::new(Scheduler::new());
/// let (link, outgoing) = ChannelLink::new();
/// let transfer = ItemTransfer::new(link, scheduler.clone(), TransferConfig::from_env());
/// let _pump = item_transfer::scheduler::pump::spawn_default(scheduler);
///
/// transfer.upload_async(1, Category::Geofence, fence_items, |result| {
///     println!("geofence upload: {result:?}");
/// });
/// ```
pub struct ItemTransfer<I: Item, L: Link<I> + 'static> {
    inner: Arc<Inner<I, L>>,
}

impl<I: Item, L: Link<I> + 'static> Clone for ItemTransfer<I, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Item, L: Link<I> + 'static> ItemTransfer<I, L> {
    /// Create an engine sending through `link` and arming deadlines on
    /// `scheduler`.
    pub fn new(link: L, scheduler: Arc<Scheduler>, config: TransferConfig) -> Self {
        debug!(
            retry_interval = ?config.retry_interval,
            max_retries = config.max_retries,
            debugging = config.debugging,
            "item transfer engine created"
        );
        Self {
            inner: Arc::new(Inner {
                link,
                scheduler,
                config,
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Scheduler deadlines are armed on.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// The outbound link.
    pub fn link(&self) -> &L {
        &self.inner.link
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Start sending `items` to `system`; `callback` gets the result.
    pub fn upload_async<F>(&self, system: SystemId, category: Category, items: Vec<I>, callback: F)
    where
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        self.start_upload(system, category, items, Box::new(callback), None);
    }

    /// Like [`upload_async`](Self::upload_async), reporting progress as each
    /// item is first requested.
    pub fn upload_with_progress_async<P, F>(
        &self,
        system: SystemId,
        category: Category,
        items: Vec<I>,
        progress: P,
        callback: F,
    ) where
        P: Fn(f32) + Send + Sync + 'static,
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        self.start_upload(system, category, items, Box::new(callback), Some(Arc::new(progress)));
    }

    /// Send `items` to `system` and wait for the result.
    pub fn upload(
        &self,
        system: SystemId,
        category: Category,
        items: Vec<I>,
    ) -> Result<(), TransferError> {
        wait(|done| self.upload_async(system, category, items, done))
    }

    /// Replace the remote collection with nothing.
    pub fn clear_async<F>(&self, system: SystemId, category: Category, callback: F)
    where
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        self.upload_async(system, category, Vec::new(), callback);
    }

    /// Clear the remote collection and wait for the result.
    pub fn clear(&self, system: SystemId, category: Category) -> Result<(), TransferError> {
        wait(|done| self.clear_async(system, category, done))
    }

    /// Cancel the upload to `system` for `category`, if one is running.
    ///
    /// Returns whether a session was cancelled. Its callback receives
    /// [`TransferError::Cancelled`].
    pub fn cancel_upload(&self, system: SystemId, category: Category) -> bool {
        self.inner
            .cancel(SessionKey { system, category }, TransferKind::Upload)
    }

    // =========================================================================
    // Download
    // =========================================================================

    /// Start fetching the `category` items of `system`.
    pub fn download_async<F>(&self, system: SystemId, category: Category, callback: F)
    where
        F: FnOnce(Result<Vec<I>, TransferError>) + Send + 'static,
    {
        self.start_download(system, category, Box::new(callback), None);
    }

    /// Like [`download_async`](Self::download_async), reporting progress as
    /// each item arrives.
    pub fn download_with_progress_async<P, F>(
        &self,
        system: SystemId,
        category: Category,
        progress: P,
        callback: F,
    ) where
        P: Fn(f32) + Send + Sync + 'static,
        F: FnOnce(Result<Vec<I>, TransferError>) + Send + 'static,
    {
        self.start_download(system, category, Box::new(callback), Some(Arc::new(progress)));
    }

    /// Fetch the `category` items of `system` and wait for them.
    pub fn download(&self, system: SystemId, category: Category) -> Result<Vec<I>, TransferError> {
        wait(|done| self.download_async(system, category, done))
    }

    /// Cancel the download from `system` for `category`, if one is running.
    pub fn cancel_download(&self, system: SystemId, category: Category) -> bool {
        self.inner
            .cancel(SessionKey { system, category }, TransferKind::Download)
    }

    // =========================================================================
    // Receive incoming
    // =========================================================================

    /// Pull the `count` items `system` announced for `category` on its own.
    ///
    /// Call this after the remote's Announce arrived with no local session
    /// for it. The first ItemRequest goes out immediately; an announce of zero
    /// items is acknowledged and resolves with an empty list.
    pub fn receive_incoming_async<F>(
        &self,
        system: SystemId,
        category: Category,
        count: u16,
        callback: F,
    ) where
        F: FnOnce(Result<Vec<I>, TransferError>) + Send + 'static,
    {
        let session = Session::receive_incoming(
            self.inner.next_id(),
            SessionKey { system, category },
            count,
            &self.inner.config,
            Box::new(callback),
            None,
        );
        self.start(session);
    }

    /// Like [`receive_incoming_async`](Self::receive_incoming_async),
    /// reporting progress as each item arrives.
    pub fn receive_incoming_with_progress_async<P, F>(
        &self,
        system: SystemId,
        category: Category,
        count: u16,
        progress: P,
        callback: F,
    ) where
        P: Fn(f32) + Send + Sync + 'static,
        F: FnOnce(Result<Vec<I>, TransferError>) + Send + 'static,
    {
        let session = Session::receive_incoming(
            self.inner.next_id(),
            SessionKey { system, category },
            count,
            &self.inner.config,
            Box::new(callback),
            Some(Arc::new(progress)),
        );
        self.start(session);
    }

    /// Pull announced items and wait for them.
    pub fn receive_incoming(
        &self,
        system: SystemId,
        category: Category,
        count: u16,
    ) -> Result<Vec<I>, TransferError> {
        wait(|done| self.receive_incoming_async(system, category, count, done))
    }

    /// Cancel an incoming transfer from `system` for `category`.
    pub fn cancel_receive(&self, system: SystemId, category: Category) -> bool {
        self.inner
            .cancel(SessionKey { system, category }, TransferKind::Receive)
    }

    // =========================================================================
    // Set current
    // =========================================================================

    /// Ask `system` to make mission item `seq` current.
    ///
    /// Occupies the mission slot of `system` until the remote reports `seq`
    /// as current.
    pub fn set_current_async<F>(&self, system: SystemId, seq: u16, callback: F)
    where
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        let session = Session::set_current(
            self.inner.next_id(),
            system,
            seq,
            &self.inner.config,
            Box::new(callback),
        );
        self.start(session);
    }

    /// Make mission item `seq` current and wait for confirmation.
    pub fn set_current(&self, system: SystemId, seq: u16) -> Result<(), TransferError> {
        wait(|done| self.set_current_async(system, seq, done))
    }

    // =========================================================================
    // Incoming traffic and introspection
    // =========================================================================

    /// Feed a message received from `from`.
    ///
    /// Routed by `(from, message.category())`. Messages with no matching
    /// session are dropped.
    pub fn process_message(&self, from: SystemId, message: WireMessage<I>) {
        let key = SessionKey {
            system: from,
            category: message.category(),
        };
        let mut sessions = self.inner.lock_sessions();
        let Some(session) = sessions.get_mut(&key) else {
            trace!(
                system = from,
                category = %key.category,
                kind = message.kind(),
                "no session for message"
            );
            return;
        };
        let step = session.on_message(&self.inner.link, message);
        self.inner.apply(sessions, key, step);
    }

    /// Snapshot of the session for `(system, category)`, if any.
    pub fn session(&self, system: SystemId, category: Category) -> Option<SessionSnapshot> {
        self.inner
            .lock_sessions()
            .get(&SessionKey { system, category })
            .map(Session::snapshot)
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Whether no session is live.
    pub fn is_idle(&self) -> bool {
        self.active_sessions() == 0
    }

    fn start_upload(
        &self,
        system: SystemId,
        category: Category,
        items: Vec<I>,
        completion: ResultCallback,
        progress: Option<ProgressCallback>,
    ) {
        let key = SessionKey { system, category };
        let session = Session::upload(
            self.inner.next_id(),
            key,
            items,
            &self.inner.config,
            completion,
            progress,
        );
        self.start(session);
    }

    fn start_download(
        &self,
        system: SystemId,
        category: Category,
        completion: ItemsCallback<I>,
        progress: Option<ProgressCallback>,
    ) {
        let key = SessionKey { system, category };
        let session = Session::download(
            self.inner.next_id(),
            key,
            &self.inner.config,
            completion,
            progress,
        );
        self.start(session);
    }

    /// Busy check, first send and deadline arming under one lock.
    fn start(&self, mut session: Session<I>) {
        let key = session.key();
        let outcome = {
            let mut sessions = self.inner.lock_sessions();
            if sessions.contains_key(&key) {
                warn!(
                    system = key.system,
                    category = %key.category,
                    "transfer already in progress"
                );
                Err(TransferError::Busy)
            } else {
                match session.start(&self.inner.link) {
                    Step::Resolved(outcome) => outcome,
                    Step::Unchanged | Step::Progressed { .. } => {
                        let cookie = Inner::arm_deadline(&self.inner, key, session.id());
                        session.set_cookie(cookie);
                        sessions.insert(key, session);
                        return;
                    }
                }
            }
        };
        session.finish(outcome);
    }
}

impl<I: Item, L: Link<I> + 'static> Inner<I, L> {
    fn lock_sessions(&self) -> MutexGuard<'_, SessionTable<I>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn arm_deadline(this: &Arc<Self>, key: SessionKey, id: u64) -> Cookie {
        let weak: Weak<Self> = Arc::downgrade(this);
        this.scheduler.add_deferred(
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_deadline(key, id);
                }
            },
            this.config.retry_interval,
        )
    }

    fn on_deadline(&self, key: SessionKey, id: u64) {
        let mut sessions = self.lock_sessions();
        let session = match sessions.get_mut(&key) {
            Some(session) if session.id() == id => session,
            _ => {
                trace!(system = key.system, category = %key.category, id, "stale deadline");
                return;
            }
        };
        let step = session.on_timeout(&self.link);
        self.apply(sessions, key, step);
    }

    fn cancel(&self, key: SessionKey, kind: TransferKind) -> bool {
        let mut sessions = self.lock_sessions();
        let session = match sessions.get_mut(&key) {
            Some(session) if session.kind() == kind => session,
            _ => return false,
        };
        debug!(system = key.system, category = %key.category, %kind, "cancelling transfer");
        if let Some(cookie) = session.cookie() {
            self.scheduler.remove(cookie);
        }
        let step = session.cancel(&self.link);
        self.apply(sessions, key, step);
        true
    }

    /// Act on a step, releasing the table lock before any user callback.
    fn apply(&self, mut sessions: MutexGuard<'_, SessionTable<I>>, key: SessionKey, step: Step<I>) {
        match step {
            Step::Unchanged => {}
            Step::Progressed { progress } => {
                let Some(session) = sessions.get(&key) else {
                    return;
                };
                if let Some(cookie) = session.cookie() {
                    self.scheduler.reset(cookie);
                }
                let callback = session.progress_callback();
                drop(sessions);
                if let (Some(callback), Some(fraction)) = (callback, progress) {
                    callback(fraction);
                }
            }
            Step::Resolved(outcome) => {
                let Some(session) = sessions.remove(&key) else {
                    return;
                };
                if let Some(cookie) = session.cookie() {
                    self.scheduler.remove(cookie);
                }
                drop(sessions);
                session.finish(outcome);
            }
        }
    }
}

impl<I: Item, L: Link<I>> Drop for Inner<I, L> {
    fn drop(&mut self) {
        let sessions = std::mem::take(self.sessions.get_mut().unwrap_or_else(|e| e.into_inner()));
        if !sessions.is_empty() {
            debug!(count = sessions.len(), "engine dropped, cancelling live transfers");
        }
        for session in sessions.into_values() {
            if let Some(cookie) = session.cookie() {
                self.scheduler.remove(cookie);
            }
            session.finish(Err(TransferError::Cancelled));
        }
    }
}

/// Run `start` with a completion that feeds a oneshot, then block on it.
///
/// Inside a tokio runtime nothing is started and the call returns
/// [`TransferError::Unknown`].
fn wait<T, S>(start: S) -> Result<T, TransferError>
where
    T: Send + 'static,
    S: FnOnce(Box<dyn FnOnce(Result<T, TransferError>) + Send>),
{
    if tokio::runtime::Handle::try_current().is_ok() {
        warn!("blocking transfer call made from inside a tokio runtime");
        return Err(TransferError::Unknown);
    }
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.blocking_recv().unwrap_or(Err(TransferError::Unknown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkError;
    use crate::scheduler::ManualClock;
    use crate::transfer::AckCode;
    use crate::transfer::testing::{RecordingLink, TestItem, items};
    use std::time::Duration;

    const SYSTEM: SystemId = 1;
    const TICK: Duration = Duration::from_millis(10);

    type Outcome<T> = Arc<Mutex<Vec<Result<T, TransferError>>>>;

    struct Harness {
        clock: Arc<ManualClock>,
        link: RecordingLink,
        transfer: ItemTransfer<TestItem, RecordingLink>,
    }

    impl Harness {
        fn new(interval_ms: u64, retries: u32) -> Self {
            let clock = Arc::new(ManualClock::new());
            let scheduler = Arc::new(Scheduler::with_clock(clock.clone()));
            let link = RecordingLink::new();
            let config = TransferConfig::builder()
                .retry_interval(Duration::from_millis(interval_ms))
                .max_retries(retries)
                .build();
            let transfer = ItemTransfer::new(link.clone(), scheduler, config);
            Self {
                clock,
                link,
                transfer,
            }
        }

        /// Advance time in pump-sized steps, ticking the scheduler each step.
        fn run_for(&self, duration: Duration) {
            let steps = duration.as_millis() / TICK.as_millis();
            for _ in 0..steps {
                self.clock.advance(TICK);
                self.transfer.scheduler().run_once();
            }
        }

        fn deliver(&self, message: WireMessage<TestItem>) {
            self.transfer.process_message(SYSTEM, message);
        }

        fn upload(&self, category: Category, items: Vec<TestItem>) -> Outcome<()> {
            let outcome: Outcome<()> = Arc::default();
            let sink = outcome.clone();
            self.transfer.upload_async(SYSTEM, category, items, move |result| {
                sink.lock().unwrap().push(result);
            });
            outcome
        }

        fn download(&self, category: Category) -> Outcome<Vec<TestItem>> {
            let outcome: Outcome<Vec<TestItem>> = Arc::default();
            let sink = outcome.clone();
            self.transfer.download_async(SYSTEM, category, move |result| {
                sink.lock().unwrap().push(result);
            });
            outcome
        }
    }

    fn request(category: Category, seq: u16) -> WireMessage<TestItem> {
        WireMessage::ItemRequest { category, seq }
    }

    fn ack(category: Category, code: AckCode) -> WireMessage<TestItem> {
        WireMessage::Acknowledge { category, code }
    }

    fn provide(category: Category, seq: u16) -> WireMessage<TestItem> {
        WireMessage::Provide {
            category,
            item: TestItem::new(seq),
        }
    }

    #[test]
    fn test_geofence_upload_success() {
        let h = Harness::new(500, 5);
        let fence = items(6, Some(Category::Geofence));
        let outcome = h.upload(Category::Geofence, fence.clone());

        assert_eq!(
            h.link.last(),
            Some(WireMessage::Announce {
                category: Category::Geofence,
                count: 6
            })
        );

        for seq in 0..6 {
            h.deliver(request(Category::Geofence, seq));
            assert_eq!(
                h.link.last(),
                Some(WireMessage::Provide {
                    category: Category::Geofence,
                    item: fence[usize::from(seq)].clone()
                })
            );
        }
        let snapshot = h.transfer.session(SYSTEM, Category::Geofence).unwrap();
        assert_eq!(snapshot.state, crate::transfer::SessionState::Finalizing);
        assert_eq!(snapshot.transferred, 6);

        h.deliver(ack(Category::Geofence, AckCode::Accepted));

        assert_eq!(*outcome.lock().unwrap(), vec![Ok(())]);
        assert!(h.transfer.is_idle());
        assert!(h.transfer.scheduler().is_empty());
        assert_eq!(h.link.count(), 7);
    }

    #[test]
    fn test_timeout_after_retries() {
        let h = Harness::new(100, 3);
        let outcome = h.upload(Category::Mission, items(2, None));

        h.run_for(Duration::from_millis(390));
        assert!(outcome.lock().unwrap().is_empty());
        assert_eq!(h.link.count(), 4);

        h.run_for(Duration::from_millis(20));
        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Timeout)]);
        assert_eq!(h.link.count(), 4);
        assert!(h.transfer.is_idle());
        assert!(h.transfer.scheduler().is_empty());

        let sent = h.link.messages();
        assert!(sent.iter().all(|m| *m == sent[0]));
    }

    #[test]
    fn test_lossy_remote_duplicates() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Rally, items(3, None));

        for seq in [0, 1, 1, 2] {
            h.deliver(request(Category::Rally, seq));
        }
        h.deliver(ack(Category::Rally, AckCode::Accepted));

        assert_eq!(*outcome.lock().unwrap(), vec![Ok(())]);
        let provides: Vec<u16> = h
            .link
            .messages()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Provide { item, .. } => Some(item.seq),
                _ => None,
            })
            .collect();
        assert_eq!(provides, vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_duplicate_does_not_touch_retry_budget() {
        let h = Harness::new(100, 3);
        let _outcome = h.upload(Category::Rally, items(3, None));
        h.deliver(request(Category::Rally, 0));
        h.run_for(Duration::from_millis(110));
        assert_eq!(
            h.transfer.session(SYSTEM, Category::Rally).unwrap().retries_remaining,
            2
        );

        h.deliver(request(Category::Rally, 0));
        let snapshot = h.transfer.session(SYSTEM, Category::Rally).unwrap();
        assert_eq!(snapshot.retries_remaining, 2);
        assert_eq!(snapshot.transferred, 1);
    }

    #[test]
    fn test_busy_rejects_second_session() {
        let h = Harness::new(500, 5);
        let first = h.download(Category::Geofence);
        let sent_before = h.link.count();

        let second = h.upload(Category::Geofence, items(1, None));
        assert_eq!(*second.lock().unwrap(), vec![Err(TransferError::Busy)]);
        assert_eq!(h.link.count(), sent_before);
        assert!(first.lock().unwrap().is_empty());

        // A different category or system is independent.
        let other = h.upload(Category::Rally, items(1, None));
        assert!(other.lock().unwrap().is_empty());
        assert_eq!(h.transfer.active_sessions(), 2);
    }

    #[test]
    fn test_upload_past_end_is_protocol_error() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Mission, items(2, None));

        h.deliver(request(Category::Mission, 2));

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::ProtocolError)]
        );
        assert!(h.transfer.scheduler().is_empty());
    }

    #[test]
    fn test_negative_ack_is_terminal() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Mission, items(4, None));

        h.deliver(request(Category::Mission, 0));
        h.deliver(ack(Category::Mission, AckCode::NoSpace));

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::TooManyItems)]
        );
        assert!(h.transfer.is_idle());
    }

    #[test]
    fn test_premature_accept_is_protocol_error() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Mission, items(2, None));

        h.deliver(request(Category::Mission, 0));
        h.deliver(ack(Category::Mission, AckCode::Accepted));

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::ProtocolError)]
        );
    }

    #[test]
    fn test_clear_is_empty_upload() {
        let h = Harness::new(500, 5);
        let outcome: Outcome<()> = Arc::default();
        let sink = outcome.clone();
        h.transfer.clear_async(SYSTEM, Category::Geofence, move |r| {
            sink.lock().unwrap().push(r);
        });

        assert_eq!(
            h.link.last(),
            Some(WireMessage::Announce {
                category: Category::Geofence,
                count: 0
            })
        );
        h.deliver(ack(Category::Geofence, AckCode::Accepted));
        assert_eq!(*outcome.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn test_invalid_upload_sends_nothing() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Mission, vec![TestItem::new(1)]);

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::InvalidSequence)]
        );
        assert_eq!(h.link.count(), 0);
        assert!(h.transfer.is_idle());
        assert!(h.transfer.scheduler().is_empty());
    }

    #[test]
    fn test_download_success() {
        let h = Harness::new(500, 5);
        let outcome = h.download(Category::Rally);
        assert_eq!(
            h.link.last(),
            Some(WireMessage::ListRequest {
                category: Category::Rally
            })
        );

        h.deliver(WireMessage::Announce {
            category: Category::Rally,
            count: 3,
        });
        assert_eq!(h.link.last(), Some(request(Category::Rally, 0)));

        h.deliver(provide(Category::Rally, 0));
        h.deliver(provide(Category::Rally, 2));
        assert_eq!(h.link.last(), Some(request(Category::Rally, 1)));
        h.deliver(provide(Category::Rally, 1));
        h.deliver(provide(Category::Rally, 2));

        assert_eq!(h.link.last(), Some(ack(Category::Rally, AckCode::Accepted)));
        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Ok(vec![TestItem::new(0), TestItem::new(1), TestItem::new(2)])]
        );
        assert!(h.transfer.scheduler().is_empty());
    }

    #[test]
    fn test_download_empty_remote() {
        let h = Harness::new(500, 5);
        let outcome = h.download(Category::Mission);

        h.deliver(WireMessage::Announce {
            category: Category::Mission,
            count: 0,
        });

        assert_eq!(h.link.last(), Some(ack(Category::Mission, AckCode::Accepted)));
        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::NoMissionAvailable)]
        );
    }

    #[test]
    fn test_download_retries_last_request() {
        let h = Harness::new(100, 3);
        let _outcome = h.download(Category::Rally);
        h.deliver(WireMessage::Announce {
            category: Category::Rally,
            count: 2,
        });
        h.deliver(provide(Category::Rally, 0));

        h.run_for(Duration::from_millis(110));
        assert_eq!(h.link.last(), Some(request(Category::Rally, 1)));
        assert_eq!(
            h.transfer.session(SYSTEM, Category::Rally).unwrap().retries_remaining,
            2
        );
    }

    #[test]
    fn test_download_negative_ack() {
        let h = Harness::new(500, 5);
        let outcome = h.download(Category::Rally);
        h.deliver(ack(Category::Rally, AckCode::Denied));

        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Denied)]);
    }

    #[test]
    fn test_cancel_upload() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Geofence, items(3, None));
        h.deliver(request(Category::Geofence, 0));

        assert!(h.transfer.cancel_upload(SYSTEM, Category::Geofence));
        assert!(!h.transfer.cancel_upload(SYSTEM, Category::Geofence));

        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Cancelled)]);
        assert_eq!(
            h.link.last(),
            Some(ack(Category::Geofence, AckCode::OperationCancelled))
        );
        assert!(h.transfer.is_idle());
        assert!(h.transfer.scheduler().is_empty());

        // Late traffic for the cancelled session is ignored.
        h.deliver(request(Category::Geofence, 1));
        assert_eq!(outcome.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_wrong_kind_is_noop() {
        let h = Harness::new(500, 5);
        let outcome = h.download(Category::Geofence);

        assert!(!h.transfer.cancel_upload(SYSTEM, Category::Geofence));
        assert!(outcome.lock().unwrap().is_empty());
        assert!(h.transfer.cancel_download(SYSTEM, Category::Geofence));
        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Cancelled)]);
    }

    #[test]
    fn test_cancel_with_dead_link_still_resolves() {
        let h = Harness::new(500, 5);
        let outcome = h.download(Category::Rally);
        h.link.set_failing(true);

        assert!(h.transfer.cancel_download(SYSTEM, Category::Rally));
        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Cancelled)]);
    }

    #[test]
    fn test_connection_error_on_start() {
        let h = Harness::new(500, 5);
        h.link.set_failing(true);
        let outcome = h.upload(Category::Mission, items(1, None));

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::ConnectionError)]
        );
        assert!(h.transfer.is_idle());
        assert!(h.transfer.scheduler().is_empty());
    }

    #[test]
    fn test_connection_error_on_resend() {
        let h = Harness::new(100, 3);
        let outcome = h.download(Category::Mission);
        h.link.set_failing(true);

        h.run_for(Duration::from_millis(110));
        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Err(TransferError::ConnectionError)]
        );
    }

    #[test]
    fn test_progress_reports() {
        let h = Harness::new(500, 5);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        h.transfer.upload_with_progress_async(
            SYSTEM,
            Category::Mission,
            items(3, None),
            move |p| sink.lock().unwrap().push(p),
            |_| {},
        );

        for seq in [0, 1, 1, 2] {
            h.deliver(request(Category::Mission, seq));
        }
        h.deliver(ack(Category::Mission, AckCode::Accepted));

        assert_eq!(*reports.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_download_progress_reports() {
        let h = Harness::new(500, 5);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        h.transfer.download_with_progress_async(
            SYSTEM,
            Category::Rally,
            move |p| sink.lock().unwrap().push(p),
            |_| {},
        );

        h.deliver(WireMessage::Announce {
            category: Category::Rally,
            count: 2,
        });
        h.deliver(provide(Category::Rally, 0));
        h.deliver(provide(Category::Rally, 1));

        assert_eq!(*reports.lock().unwrap(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_set_current() {
        let h = Harness::new(500, 5);
        let outcome: Outcome<()> = Arc::default();
        let sink = outcome.clone();
        h.transfer.set_current_async(SYSTEM, 3, move |r| {
            sink.lock().unwrap().push(r);
        });
        assert_eq!(h.link.last(), Some(WireMessage::SetCurrent { seq: 3 }));

        h.deliver(WireMessage::CurrentReport { seq: 1 });
        assert!(outcome.lock().unwrap().is_empty());
        assert_eq!(h.link.count(), 2);

        h.deliver(WireMessage::CurrentReport { seq: 3 });
        assert_eq!(*outcome.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn test_completion_can_start_new_transfer() {
        let h = Harness::new(500, 5);
        let outcome: Outcome<()> = Arc::default();
        let sink = outcome.clone();
        let transfer = h.transfer.clone();
        h.transfer.clear_async(SYSTEM, Category::Mission, move |result| {
            assert_eq!(result, Ok(()));
            let sink = sink.clone();
            transfer.clear_async(SYSTEM, Category::Mission, move |r| {
                sink.lock().unwrap().push(r);
            });
        });

        h.deliver(ack(Category::Mission, AckCode::Accepted));
        assert_eq!(h.transfer.active_sessions(), 1);
        h.deliver(ack(Category::Mission, AckCode::Accepted));
        assert_eq!(*outcome.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn test_unrelated_messages_ignored() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Mission, items(1, None));

        h.transfer.process_message(9, request(Category::Mission, 0));
        h.deliver(request(Category::Rally, 0));
        h.deliver(provide(Category::Mission, 0));

        assert_eq!(h.link.count(), 1);
        assert!(outcome.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_cancels_live_sessions() {
        let h = Harness::new(500, 5);
        let outcome = h.upload(Category::Mission, items(1, None));
        let scheduler = h.transfer.scheduler().clone();
        assert_eq!(scheduler.len(), 1);

        drop(h);

        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Cancelled)]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_blocking_upload_from_thread() {
        let h = Harness::new(500, 5);
        let transfer = h.transfer.clone();
        let worker = std::thread::spawn(move || transfer.upload(SYSTEM, Category::Rally, items(1, None)));

        while h.transfer.is_idle() {
            std::thread::yield_now();
        }
        h.deliver(request(Category::Rally, 0));
        h.deliver(ack(Category::Rally, AckCode::Accepted));

        assert_eq!(worker.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_blocking_download_from_thread() {
        let h = Harness::new(500, 5);
        let transfer = h.transfer.clone();
        let worker = std::thread::spawn(move || transfer.download(SYSTEM, Category::Rally));

        while h.transfer.is_idle() {
            std::thread::yield_now();
        }
        h.deliver(WireMessage::Announce {
            category: Category::Rally,
            count: 1,
        });
        h.deliver(provide(Category::Rally, 0));

        assert_eq!(worker.join().unwrap(), Ok(vec![TestItem::new(0)]));
    }

    #[test]
    fn test_repeated_request_cannot_outlive_budget() {
        let h = Harness::new(100, 3);
        let outcome = h.upload(Category::Mission, items(2, None));
        h.deliver(request(Category::Mission, 0));

        // Re-request the same item faster than the retry interval.
        for _ in 0..20 {
            h.run_for(Duration::from_millis(90));
            h.deliver(request(Category::Mission, 0));
            if !outcome.lock().unwrap().is_empty() {
                break;
            }
        }

        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Timeout)]);
        assert!(h.transfer.is_idle());
        assert!(h.transfer.scheduler().is_empty());
    }

    #[test]
    fn test_mission_download_with_repeated_item() {
        let h = Harness::new(500, 5);
        let outcome = h.download(Category::Mission);
        h.deliver(WireMessage::Announce {
            category: Category::Mission,
            count: 3,
        });

        for seq in [0, 1, 1, 2] {
            h.deliver(provide(Category::Mission, seq));
        }

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Ok(vec![TestItem::new(0), TestItem::new(1), TestItem::new(2)])]
        );
        let requests: Vec<u16> = h
            .link
            .messages()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::ItemRequest { seq, .. } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![0, 1, 2]);
    }

    #[test]
    fn test_receive_incoming() {
        let h = Harness::new(100, 3);
        let outcome: Outcome<Vec<TestItem>> = Arc::default();
        let sink = outcome.clone();
        h.transfer
            .receive_incoming_async(SYSTEM, Category::Geofence, 2, move |r| {
                sink.lock().unwrap().push(r);
            });

        assert_eq!(h.link.last(), Some(request(Category::Geofence, 0)));
        let snapshot = h.transfer.session(SYSTEM, Category::Geofence).unwrap();
        assert_eq!(snapshot.kind, TransferKind::Receive);

        // Lost item: the request is repeated on the deadline.
        h.run_for(Duration::from_millis(110));
        assert_eq!(h.link.count(), 2);
        assert_eq!(h.link.last(), Some(request(Category::Geofence, 0)));

        h.deliver(provide(Category::Geofence, 0));
        assert_eq!(h.link.last(), Some(request(Category::Geofence, 1)));
        h.deliver(provide(Category::Geofence, 1));

        assert_eq!(
            h.link.last(),
            Some(ack(Category::Geofence, AckCode::Accepted))
        );
        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Ok(vec![TestItem::new(0), TestItem::new(1)])]
        );
        assert!(h.transfer.scheduler().is_empty());
    }

    #[test]
    fn test_receive_incoming_empty_and_busy() {
        let h = Harness::new(500, 5);
        let outcome: Outcome<Vec<TestItem>> = Arc::default();

        let sink = outcome.clone();
        h.transfer.receive_incoming_async(SYSTEM, Category::Rally, 0, move |r| {
            sink.lock().unwrap().push(r);
        });
        assert_eq!(h.link.last(), Some(ack(Category::Rally, AckCode::Accepted)));
        assert_eq!(*outcome.lock().unwrap(), vec![Ok(Vec::new())]);
        assert!(h.transfer.is_idle());

        let _upload = h.upload(Category::Rally, items(1, None));
        let sink = outcome.clone();
        h.transfer.receive_incoming_async(SYSTEM, Category::Rally, 3, move |r| {
            sink.lock().unwrap().push(r);
        });
        assert_eq!(outcome.lock().unwrap()[1], Err(TransferError::Busy));
    }

    #[test]
    fn test_cancel_receive() {
        let h = Harness::new(500, 5);
        let outcome: Outcome<Vec<TestItem>> = Arc::default();
        let sink = outcome.clone();
        h.transfer.receive_incoming_async(SYSTEM, Category::Mission, 4, move |r| {
            sink.lock().unwrap().push(r);
        });

        assert!(!h.transfer.cancel_download(SYSTEM, Category::Mission));
        assert!(h.transfer.cancel_receive(SYSTEM, Category::Mission));
        assert_eq!(*outcome.lock().unwrap(), vec![Err(TransferError::Cancelled)]);
        assert_eq!(
            h.link.last(),
            Some(ack(Category::Mission, AckCode::OperationCancelled))
        );
    }

    #[tokio::test]
    async fn test_blocking_call_inside_runtime_is_refused() {
        let h = Harness::new(500, 5);

        let result = h.transfer.upload(SYSTEM, Category::Mission, items(1, None));

        assert_eq!(result, Err(TransferError::Unknown));
        assert_eq!(h.link.count(), 0);
        assert!(h.transfer.is_idle());
    }

    #[test]
    fn test_channel_link_engine() {
        let scheduler = Arc::new(Scheduler::new());
        let (link, mut rx) = crate::link::ChannelLink::<TestItem>::new();
        let transfer = ItemTransfer::new(link, scheduler, TransferConfig::default());

        transfer.download_async(SYSTEM, Category::Mission, |_| {});
        let first = rx.try_recv().unwrap();
        assert_eq!(first.target, SYSTEM);
        assert_eq!(
            first.message,
            WireMessage::ListRequest {
                category: Category::Mission
            }
        );

        drop(rx);
        assert!(transfer.link().is_closed());
        let err = transfer
            .link()
            .send(SYSTEM, WireMessage::SetCurrent { seq: 0 })
            .unwrap_err();
        assert_eq!(err, LinkError::Closed);
    }
}
