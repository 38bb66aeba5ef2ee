//! Shared fixtures for transfer tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::{Category, Item, LinkError, SystemId};
use crate::link::Link;
use crate::transfer::WireMessage;

/// Minimal item: a sequence number, a payload and an optional category tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TestItem {
    pub seq: u16,
    pub payload: u32,
    pub category: Option<Category>,
}

impl TestItem {
    pub fn new(seq: u16) -> Self {
        Self {
            seq,
            payload: u32::from(seq) * 10,
            category: None,
        }
    }

    pub fn in_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

impl Item for TestItem {
    fn seq(&self) -> u16 {
        self.seq
    }

    fn category(&self) -> Option<Category> {
        self.category
    }
}

/// `count` items numbered from zero.
pub(crate) fn items(count: u16, category: Option<Category>) -> Vec<TestItem> {
    (0..count)
        .map(|seq| TestItem {
            category,
            ..TestItem::new(seq)
        })
        .collect()
}

/// Link that records every message and can be told to fail.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingLink {
    sent: Arc<Mutex<Vec<(SystemId, WireMessage<TestItem>)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(SystemId, WireMessage<TestItem>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<WireMessage<TestItem>> {
        self.sent().into_iter().map(|(_, m)| m).collect()
    }

    pub fn last(&self) -> Option<WireMessage<TestItem>> {
        self.sent.lock().unwrap().last().map(|(_, m)| m.clone())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Link<TestItem> for RecordingLink {
    fn send(&self, target: SystemId, message: WireMessage<TestItem>) -> Result<(), LinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LinkError::SendFailed("link down".into()));
        }
        self.sent.lock().unwrap().push((target, message));
        Ok(())
    }
}
