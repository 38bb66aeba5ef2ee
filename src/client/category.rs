//! Category-bound client handle.

use crate::core::{Category, Item, SystemId, TransferError};
use crate::link::Link;
use crate::transfer::{ItemTransfer, SessionSnapshot};

/// An [`ItemTransfer`] bound to a fixed `(system, category)` pair.
///
/// # Example
///
/// ```ignore
/// let fence = CategoryClient::new(transfer.clone(), 1, Category::Geofence);
/// fence.upload(vertices)?;
/// let back = fence.download()?;
/// ```
pub struct CategoryClient<I: Item, L: Link<I> + 'static> {
    transfer: ItemTransfer<I, L>,
    system: SystemId,
    category: Category,
}

impl<I: Item, L: Link<I> + 'static> Clone for CategoryClient<I, L> {
    fn clone(&self) -> Self {
        Self {
            transfer: self.transfer.clone(),
            system: self.system,
            category: self.category,
        }
    }
}

impl<I: Item, L: Link<I> + 'static> CategoryClient<I, L> {
    /// Bind `transfer` to `system` and `category`.
    pub fn new(transfer: ItemTransfer<I, L>, system: SystemId, category: Category) -> Self {
        Self {
            transfer,
            system,
            category,
        }
    }

    /// Remote system this client talks to.
    pub fn system(&self) -> SystemId {
        self.system
    }

    /// Category this client manages.
    pub fn category(&self) -> Category {
        self.category
    }

    /// Underlying engine.
    pub fn transfer(&self) -> &ItemTransfer<I, L> {
        &self.transfer
    }

    /// Replace the remote items with `items`.
    pub fn upload(&self, items: Vec<I>) -> Result<(), TransferError> {
        self.transfer.upload(self.system, self.category, items)
    }

    /// Replace the remote items with `items` without waiting.
    pub fn upload_async<F>(&self, items: Vec<I>, callback: F)
    where
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        self.transfer
            .upload_async(self.system, self.category, items, callback);
    }

    /// Fetch the remote items.
    pub fn download(&self) -> Result<Vec<I>, TransferError> {
        self.transfer.download(self.system, self.category)
    }

    /// Fetch the remote items without waiting.
    pub fn download_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<Vec<I>, TransferError>) + Send + 'static,
    {
        self.transfer
            .download_async(self.system, self.category, callback);
    }

    /// Pull the `count` items the remote has just announced, without waiting.
    pub fn receive_incoming_async<F>(&self, count: u16, callback: F)
    where
        F: FnOnce(Result<Vec<I>, TransferError>) + Send + 'static,
    {
        self.transfer
            .receive_incoming_async(self.system, self.category, count, callback);
    }

    /// Remove every remote item.
    pub fn clear(&self) -> Result<(), TransferError> {
        self.transfer.clear(self.system, self.category)
    }

    /// Remove every remote item without waiting.
    pub fn clear_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        self.transfer.clear_async(self.system, self.category, callback);
    }

    /// Cancel a running upload. Returns whether one was running.
    pub fn cancel_upload(&self) -> bool {
        self.transfer.cancel_upload(self.system, self.category)
    }

    /// Cancel a running download. Returns whether one was running.
    pub fn cancel_download(&self) -> bool {
        self.transfer.cancel_download(self.system, self.category)
    }

    /// Cancel a running incoming receive. Returns whether one was running.
    pub fn cancel_receive(&self) -> bool {
        self.transfer.cancel_receive(self.system, self.category)
    }

    /// Make mission item `seq` current on the remote.
    ///
    /// Only meaningful for the mission category; other categories get
    /// [`TransferError::Unsupported`] without anything being sent.
    pub fn set_current(&self, seq: u16) -> Result<(), TransferError> {
        if self.category != Category::Mission {
            return Err(TransferError::Unsupported);
        }
        self.transfer.set_current(self.system, seq)
    }

    /// Make mission item `seq` current without waiting.
    pub fn set_current_async<F>(&self, seq: u16, callback: F)
    where
        F: FnOnce(Result<(), TransferError>) + Send + 'static,
    {
        if self.category != Category::Mission {
            callback(Err(TransferError::Unsupported));
            return;
        }
        self.transfer.set_current_async(self.system, seq, callback);
    }

    /// Snapshot of this client's running session, if any.
    pub fn session(&self) -> Option<SessionSnapshot> {
        self.transfer.session(self.system, self.category)
    }

    /// Whether a session is running for this client.
    pub fn is_busy(&self) -> bool {
        self.session().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::scheduler::Scheduler;
    use crate::transfer::testing::{RecordingLink, TestItem, items};
    use crate::transfer::{AckCode, TransferConfig, TransferKind, WireMessage};

    fn client(category: Category) -> (CategoryClient<TestItem, RecordingLink>, RecordingLink) {
        let link = RecordingLink::new();
        let transfer = ItemTransfer::new(
            link.clone(),
            Arc::new(Scheduler::new()),
            TransferConfig::default(),
        );
        (CategoryClient::new(transfer, 7, category), link)
    }

    #[test]
    fn test_client_binds_system_and_category() {
        let (rally, link) = client(Category::Rally);
        rally.upload_async(items(2, None), |_| {});

        assert_eq!(
            link.sent(),
            vec![(
                7,
                WireMessage::Announce {
                    category: Category::Rally,
                    count: 2
                }
            )]
        );
        let snapshot = rally.session().unwrap();
        assert_eq!(snapshot.kind, TransferKind::Upload);
        assert!(rally.is_busy());
    }

    #[test]
    fn test_client_download_and_cancel() {
        let (fence, link) = client(Category::Geofence);
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        fence.download_async(move |r| *sink.lock().unwrap() = Some(r));

        assert!(!fence.cancel_upload());
        assert!(fence.cancel_download());
        assert_eq!(*outcome.lock().unwrap(), Some(Err(TransferError::Cancelled)));
        assert_eq!(
            link.last(),
            Some(WireMessage::Acknowledge {
                category: Category::Geofence,
                code: AckCode::OperationCancelled
            })
        );
        assert!(!fence.is_busy());
    }

    #[test]
    fn test_client_receive_incoming() {
        let (rally, link) = client(Category::Rally);
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        rally.receive_incoming_async(1, move |r| *sink.lock().unwrap() = Some(r));

        assert_eq!(
            link.sent(),
            vec![(
                7,
                WireMessage::ItemRequest {
                    category: Category::Rally,
                    seq: 0
                }
            )]
        );
        assert!(!rally.cancel_download());
        assert!(rally.cancel_receive());
        assert_eq!(*outcome.lock().unwrap(), Some(Err(TransferError::Cancelled)));
        assert!(!rally.is_busy());
    }

    #[test]
    fn test_client_clear() {
        let (mission, _link) = client(Category::Mission);
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        mission.clear_async(move |r| *sink.lock().unwrap() = Some(r));

        mission.transfer().process_message(
            7,
            WireMessage::Acknowledge {
                category: Category::Mission,
                code: AckCode::Accepted,
            },
        );
        assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn test_set_current_requires_mission() {
        let (rally, link) = client(Category::Rally);
        assert_eq!(rally.set_current(2), Err(TransferError::Unsupported));

        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        rally.set_current_async(2, move |r| *sink.lock().unwrap() = Some(r));
        assert_eq!(*outcome.lock().unwrap(), Some(Err(TransferError::Unsupported)));
        assert_eq!(link.count(), 0);
    }

    #[test]
    fn test_set_current_mission() {
        let (mission, link) = client(Category::Mission);
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        mission.set_current_async(5, move |r| *sink.lock().unwrap() = Some(r));

        assert_eq!(link.last(), Some(WireMessage::SetCurrent { seq: 5 }));
        mission
            .transfer()
            .process_message(7, WireMessage::CurrentReport { seq: 5 });
        assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn test_blocking_download_through_client() {
        let (rally, _link) = client(Category::Rally);
        let worker = {
            let rally = rally.clone();
            std::thread::spawn(move || rally.download())
        };

        while !rally.is_busy() {
            std::thread::yield_now();
        }
        let engine = rally.transfer();
        engine.process_message(
            7,
            WireMessage::Announce {
                category: Category::Rally,
                count: 1,
            },
        );
        engine.process_message(
            7,
            WireMessage::Provide {
                category: Category::Rally,
                item: TestItem::new(0),
            },
        );

        assert_eq!(worker.join().unwrap(), Ok(vec![TestItem::new(0)]));
    }
}
