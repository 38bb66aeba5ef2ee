//! Per-session transfer state machine.
//!
//! A [`Session`] owns everything one exchange needs: the items, the retry
//! budget, the last message sent and the completion callback. It never touches
//! the scheduler or the session table. Each handler returns a [`Step`] and the
//! engine applies it (deadline reset, removal, callback delivery) after
//! dropping its lock.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{AckCode, TransferConfig, WireMessage};
use crate::core::{Category, Item, SystemId, TransferError};
use crate::link::Link;
use crate::scheduler::Cookie;

/// Completion of an upload, clear or set-current.
pub type ResultCallback = Box<dyn FnOnce(Result<(), TransferError>) + Send>;

/// Completion of a download.
pub type ItemsCallback<I> = Box<dyn FnOnce(Result<Vec<I>, TransferError>) + Send>;

/// Progress report, a fraction in `[0, 1]`.
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Identifies the one session allowed per remote system and category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Remote system.
    pub system: SystemId,
    /// Item collection.
    pub category: Category,
}

/// What a session is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Sending items to the remote.
    Upload,
    /// Fetching items from the remote.
    Download,
    /// Pulling items the remote announced on its own.
    Receive,
    /// Selecting the remote's current mission item.
    SetCurrent,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
            Self::Receive => write!(f, "receive"),
            Self::SetCurrent => write!(f, "set-current"),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionState {
    /// Created, nothing sent yet.
    Idle,
    /// First message sent, waiting for the remote to engage.
    Announcing,
    /// Items are moving.
    Transferring,
    /// All items moved, waiting for the final acknowledge.
    Finalizing,
    /// Cancelled locally, result pending delivery.
    Cancelling,
    /// Resolved.
    Done,
}

/// Read-only view of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Remote system.
    pub system: SystemId,
    /// Item collection.
    pub category: Category,
    /// Upload, download or set-current.
    pub kind: TransferKind,
    /// Current state.
    pub state: SessionState,
    /// Resends left for the current step.
    pub retries_remaining: u32,
    /// Items answered (upload) or received (download) so far.
    pub transferred: usize,
    /// Items in the transfer, once known.
    pub total: Option<usize>,
}

/// Outcome of feeding an event to a session.
#[derive(Debug)]
pub(crate) enum Step<I> {
    /// Nothing the engine needs to act on.
    Unchanged,
    /// The exchange moved; reset the deadline and report progress if any.
    Progressed { progress: Option<f32> },
    /// The session is over.
    Resolved(Result<Vec<I>, TransferError>),
}

/// Where the result goes.
pub(crate) enum Completion<I> {
    Unit(ResultCallback),
    Items(ItemsCallback<I>),
}

impl<I> Completion<I> {
    fn deliver(self, outcome: Result<Vec<I>, TransferError>) {
        match self {
            Completion::Unit(callback) => callback(outcome.map(|_| ())),
            Completion::Items(callback) => callback(outcome),
        }
    }
}

struct Upload<I> {
    items: Vec<I>,
    answered: Vec<bool>,
    answered_count: usize,
}

impl<I> Upload<I> {
    fn is_complete(&self) -> bool {
        self.answered_count == self.items.len()
    }

    fn progress(&self) -> f32 {
        self.answered_count as f32 / (self.items.len() + 1) as f32
    }
}

struct Download<I> {
    expected: Option<usize>,
    items: Vec<I>,
    /// Started from the remote's announce rather than a list request.
    incoming: bool,
}

enum Exchange<I> {
    Upload(Upload<I>),
    Download(Download<I>),
    SetCurrent { seq: u16 },
}

/// One in-flight transfer.
pub(crate) struct Session<I> {
    id: u64,
    key: SessionKey,
    exchange: Exchange<I>,
    state: SessionState,
    retries_remaining: u32,
    max_retries: u32,
    debugging: bool,
    cookie: Option<Cookie>,
    last_sent: Option<WireMessage<I>>,
    completion: Option<Completion<I>>,
    progress: Option<ProgressCallback>,
}

impl<I: Item> Session<I> {
    fn new(
        id: u64,
        key: SessionKey,
        exchange: Exchange<I>,
        config: &TransferConfig,
        completion: Completion<I>,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            id,
            key,
            exchange,
            state: SessionState::Idle,
            retries_remaining: config.max_retries,
            max_retries: config.max_retries,
            debugging: config.debugging,
            cookie: None,
            last_sent: None,
            completion: Some(completion),
            progress,
        }
    }

    pub(crate) fn upload(
        id: u64,
        key: SessionKey,
        items: Vec<I>,
        config: &TransferConfig,
        completion: ResultCallback,
        progress: Option<ProgressCallback>,
    ) -> Self {
        let answered = vec![false; items.len()];
        let exchange = Exchange::Upload(Upload {
            items,
            answered,
            answered_count: 0,
        });
        Self::new(id, key, exchange, config, Completion::Unit(completion), progress)
    }

    pub(crate) fn download(
        id: u64,
        key: SessionKey,
        config: &TransferConfig,
        completion: ItemsCallback<I>,
        progress: Option<ProgressCallback>,
    ) -> Self {
        let exchange = Exchange::Download(Download {
            expected: None,
            items: Vec::new(),
            incoming: false,
        });
        Self::new(id, key, exchange, config, Completion::Items(completion), progress)
    }

    pub(crate) fn receive_incoming(
        id: u64,
        key: SessionKey,
        count: u16,
        config: &TransferConfig,
        completion: ItemsCallback<I>,
        progress: Option<ProgressCallback>,
    ) -> Self {
        let exchange = Exchange::Download(Download {
            expected: Some(usize::from(count)),
            items: Vec::new(),
            incoming: true,
        });
        Self::new(id, key, exchange, config, Completion::Items(completion), progress)
    }

    pub(crate) fn set_current(
        id: u64,
        system: SystemId,
        seq: u16,
        config: &TransferConfig,
        completion: ResultCallback,
    ) -> Self {
        let key = SessionKey {
            system,
            category: Category::Mission,
        };
        let exchange = Exchange::SetCurrent { seq };
        Self::new(id, key, exchange, config, Completion::Unit(completion), None)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> SessionKey {
        self.key
    }

    pub(crate) fn kind(&self) -> TransferKind {
        match self.exchange {
            Exchange::Upload(_) => TransferKind::Upload,
            Exchange::Download(Download { incoming: false, .. }) => TransferKind::Download,
            Exchange::Download(Download { incoming: true, .. }) => TransferKind::Receive,
            Exchange::SetCurrent { .. } => TransferKind::SetCurrent,
        }
    }

    pub(crate) fn cookie(&self) -> Option<Cookie> {
        self.cookie
    }

    pub(crate) fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = Some(cookie);
    }

    pub(crate) fn progress_callback(&self) -> Option<ProgressCallback> {
        self.progress.clone()
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let (transferred, total) = match &self.exchange {
            Exchange::Upload(upload) => (upload.answered_count, Some(upload.items.len())),
            Exchange::Download(download) => (download.items.len(), download.expected),
            Exchange::SetCurrent { .. } => (0, None),
        };
        SessionSnapshot {
            system: self.key.system,
            category: self.key.category,
            kind: self.kind(),
            state: self.state,
            retries_remaining: self.retries_remaining,
            transferred,
            total,
        }
    }

    /// Validate and send the first message of the exchange.
    ///
    /// `Unchanged` means the session is live and needs a deadline. `Resolved`
    /// means it ended before arming anything.
    pub(crate) fn start<L>(&mut self, link: &L) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        let (first, state) = match self.first_message() {
            Ok(first) => first,
            Err(err) => return Step::Resolved(Err(err)),
        };
        debug!(
            system = self.key.system,
            category = %self.key.category,
            kind = %self.kind(),
            "transfer started"
        );
        if let Err(err) = self.send(link, first) {
            return Step::Resolved(Err(err));
        }
        if state == SessionState::Done {
            return Step::Resolved(Ok(Vec::new()));
        }
        self.state = state;
        Step::Unchanged
    }

    fn first_message(&self) -> Result<(WireMessage<I>, SessionState), TransferError> {
        let category = self.key.category;
        let first = match &self.exchange {
            Exchange::Upload(upload) => {
                validate_upload(category, &upload.items)?;
                let count = u16::try_from(upload.items.len())
                    .map_err(|_| TransferError::TooManyItems)?;
                (WireMessage::Announce { category, count }, SessionState::Announcing)
            }
            Exchange::Download(Download {
                incoming: true,
                expected,
                ..
            }) => match expected {
                Some(0) | None => (
                    WireMessage::Acknowledge {
                        category,
                        code: AckCode::Accepted,
                    },
                    SessionState::Done,
                ),
                Some(_) => (
                    WireMessage::ItemRequest { category, seq: 0 },
                    SessionState::Transferring,
                ),
            },
            Exchange::Download(_) => (WireMessage::ListRequest { category }, SessionState::Announcing),
            Exchange::SetCurrent { seq } => {
                (WireMessage::SetCurrent { seq: *seq }, SessionState::Announcing)
            }
        };
        Ok(first)
    }

    /// Feed an incoming message routed to this session.
    pub(crate) fn on_message<L>(&mut self, link: &L, message: WireMessage<I>) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        if self.is_closing() {
            return Step::Unchanged;
        }
        if self.debugging {
            debug!(
                system = self.key.system,
                category = %self.key.category,
                ?message,
                "received"
            );
        }

        match (self.kind(), message) {
            (TransferKind::Upload, WireMessage::ItemRequest { seq, .. }) => {
                self.on_item_request(link, seq)
            }
            (TransferKind::Upload, WireMessage::Acknowledge { code, .. }) => {
                self.on_upload_ack(code)
            }
            (TransferKind::Download, WireMessage::Announce { count, .. }) => {
                self.on_announce(link, count)
            }
            (
                TransferKind::Download | TransferKind::Receive,
                WireMessage::Provide { item, .. },
            ) => self.on_provide(link, item),
            (
                TransferKind::Download | TransferKind::Receive,
                WireMessage::Acknowledge { code, .. },
            ) => {
                if code.is_accepted() {
                    return Step::Unchanged;
                }
                warn!(
                    system = self.key.system,
                    category = %self.key.category,
                    %code,
                    "download rejected by remote"
                );
                Step::Resolved(Err(code.to_error().unwrap_or(TransferError::ProtocolError)))
            }
            (TransferKind::SetCurrent, WireMessage::CurrentReport { seq }) => {
                self.on_current_report(link, seq)
            }
            (_, other) => {
                debug!(
                    system = self.key.system,
                    category = %self.key.category,
                    kind = other.kind(),
                    "message does not fit the session, ignored"
                );
                Step::Unchanged
            }
        }
    }

    /// Handle an expired deadline: resend or give up.
    pub(crate) fn on_timeout<L>(&mut self, link: &L) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        if self.is_closing() {
            return Step::Unchanged;
        }
        if self.retries_remaining == 0 {
            warn!(
                system = self.key.system,
                category = %self.key.category,
                state = ?self.state,
                "retries exhausted"
            );
            return Step::Resolved(Err(TransferError::Timeout));
        }
        self.retries_remaining -= 1;

        let Some(message) = self.last_sent.clone() else {
            return Step::Resolved(Err(TransferError::Unknown));
        };
        debug!(
            system = self.key.system,
            category = %self.key.category,
            kind = message.kind(),
            retries_remaining = self.retries_remaining,
            "deadline expired, resending"
        );
        match self.send(link, message) {
            Ok(()) => Step::Unchanged,
            Err(err) => Step::Resolved(Err(err)),
        }
    }

    /// Cancel locally and tell the remote, best-effort.
    pub(crate) fn cancel<L>(&mut self, link: &L) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        self.state = SessionState::Cancelling;
        let message = WireMessage::Acknowledge {
            category: self.key.category,
            code: AckCode::OperationCancelled,
        };
        if let Err(err) = link.send(self.key.system, message) {
            warn!(
                system = self.key.system,
                category = %self.key.category,
                %err,
                "could not notify remote of cancellation"
            );
        }
        Step::Resolved(Err(TransferError::Cancelled))
    }

    /// Deliver the result. Consumes the session.
    pub(crate) fn finish(mut self, outcome: Result<Vec<I>, TransferError>) {
        self.state = SessionState::Done;
        match &outcome {
            Ok(_) => {
                debug!(
                    system = self.key.system,
                    category = %self.key.category,
                    kind = %self.kind(),
                    "transfer finished"
                );
                if let Some(progress) = &self.progress {
                    progress(1.0);
                }
            }
            Err(err) => debug!(
                system = self.key.system,
                category = %self.key.category,
                kind = %self.kind(),
                %err,
                "transfer failed"
            ),
        }
        if let Some(completion) = self.completion.take() {
            completion.deliver(outcome);
        }
    }

    fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Cancelling | SessionState::Done)
    }

    fn send<L>(&mut self, link: &L, message: WireMessage<I>) -> Result<(), TransferError>
    where
        L: Link<I> + ?Sized,
    {
        if self.debugging {
            debug!(
                system = self.key.system,
                category = %self.key.category,
                ?message,
                "sending"
            );
        }
        match link.send(self.key.system, message.clone()) {
            Ok(()) => {
                self.last_sent = Some(message);
                Ok(())
            }
            Err(err) => {
                warn!(
                    system = self.key.system,
                    category = %self.key.category,
                    %err,
                    "local send failed"
                );
                Err(TransferError::ConnectionError)
            }
        }
    }

    fn on_item_request<L>(&mut self, link: &L, seq: u16) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        let Exchange::Upload(upload) = &self.exchange else {
            return Step::Unchanged;
        };
        let index = usize::from(seq);
        let Some(item) = upload.items.get(index).cloned() else {
            warn!(
                system = self.key.system,
                category = %self.key.category,
                seq,
                count = upload.items.len(),
                "remote requested an item past the end"
            );
            return Step::Resolved(Err(TransferError::ProtocolError));
        };
        let first_answer = !upload.answered[index];

        let message = WireMessage::Provide {
            category: self.key.category,
            item,
        };
        if let Err(err) = self.send(link, message) {
            return Step::Resolved(Err(err));
        }
        if !first_answer {
            // Repeats do not push the deadline back.
            return Step::Unchanged;
        }

        let Exchange::Upload(upload) = &mut self.exchange else {
            return Step::Unchanged;
        };
        upload.answered[index] = true;
        upload.answered_count += 1;
        let progress = upload.progress();
        self.state = if upload.is_complete() {
            SessionState::Finalizing
        } else {
            SessionState::Transferring
        };
        self.retries_remaining = self.max_retries;
        Step::Progressed {
            progress: Some(progress),
        }
    }

    fn on_upload_ack(&mut self, code: AckCode) -> Step<I> {
        let Exchange::Upload(upload) = &self.exchange else {
            return Step::Unchanged;
        };
        if let Some(err) = code.to_error() {
            warn!(
                system = self.key.system,
                category = %self.key.category,
                %code,
                "upload rejected by remote"
            );
            return Step::Resolved(Err(err));
        }
        if upload.is_complete() {
            Step::Resolved(Ok(Vec::new()))
        } else {
            warn!(
                system = self.key.system,
                category = %self.key.category,
                answered = upload.answered_count,
                count = upload.items.len(),
                "remote accepted before every item was sent"
            );
            Step::Resolved(Err(TransferError::ProtocolError))
        }
    }

    fn on_announce<L>(&mut self, link: &L, count: u16) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        if self.state != SessionState::Announcing {
            return Step::Unchanged;
        }
        let category = self.key.category;

        if count == 0 {
            let ack = WireMessage::Acknowledge {
                category,
                code: AckCode::Accepted,
            };
            if let Err(err) = self.send(link, ack) {
                return Step::Resolved(Err(err));
            }
            return Step::Resolved(Err(TransferError::NoMissionAvailable));
        }

        if let Exchange::Download(download) = &mut self.exchange {
            download.expected = Some(usize::from(count));
        }
        if let Err(err) = self.send(link, WireMessage::ItemRequest { category, seq: 0 }) {
            return Step::Resolved(Err(err));
        }
        self.state = SessionState::Transferring;
        self.retries_remaining = self.max_retries;
        Step::Progressed {
            progress: Some(0.0),
        }
    }

    fn on_provide<L>(&mut self, link: &L, item: I) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        if self.state != SessionState::Transferring {
            return Step::Unchanged;
        }
        let category = self.key.category;
        let Exchange::Download(download) = &mut self.exchange else {
            return Step::Unchanged;
        };
        let Some(expected) = download.expected else {
            return Step::Unchanged;
        };
        let next = download.items.len();
        if usize::from(item.seq()) != next {
            debug!(
                system = self.key.system,
                %category,
                seq = item.seq(),
                next,
                "unexpected item sequence, ignored"
            );
            return Step::Unchanged;
        }

        download.items.push(item);
        let received = download.items.len();

        if received == expected {
            let ack = WireMessage::Acknowledge {
                category,
                code: AckCode::Accepted,
            };
            self.state = SessionState::Finalizing;
            if let Err(err) = self.send(link, ack) {
                return Step::Resolved(Err(err));
            }
            let items = match &mut self.exchange {
                Exchange::Download(download) => std::mem::take(&mut download.items),
                _ => Vec::new(),
            };
            return Step::Resolved(Ok(items));
        }

        let Ok(seq) = u16::try_from(received) else {
            return Step::Resolved(Err(TransferError::ProtocolError));
        };
        if let Err(err) = self.send(link, WireMessage::ItemRequest { category, seq }) {
            return Step::Resolved(Err(err));
        }
        self.retries_remaining = self.max_retries;
        Step::Progressed {
            progress: Some(received as f32 / expected as f32),
        }
    }

    fn on_current_report<L>(&mut self, link: &L, reported: u16) -> Step<I>
    where
        L: Link<I> + ?Sized,
    {
        let Exchange::SetCurrent { seq } = &self.exchange else {
            return Step::Unchanged;
        };
        let seq = *seq;
        if reported == seq {
            return Step::Resolved(Ok(Vec::new()));
        }
        if self.retries_remaining == 0 {
            return Step::Resolved(Err(TransferError::Timeout));
        }
        self.retries_remaining -= 1;
        debug!(
            system = self.key.system,
            requested = seq,
            reported,
            "remote reports another current item, resending"
        );
        match self.send(link, WireMessage::SetCurrent { seq }) {
            Ok(()) => Step::Progressed { progress: None },
            Err(err) => Step::Resolved(Err(err)),
        }
    }
}

fn validate_upload<I: Item>(category: Category, items: &[I]) -> Result<(), TransferError> {
    for (index, item) in items.iter().enumerate() {
        if usize::from(item.seq()) != index {
            return Err(TransferError::InvalidSequence);
        }
        if item.category().is_some_and(|c| c != category) {
            return Err(TransferError::MissionTypeNotConsistent);
        }
    }
    Ok(())
}
