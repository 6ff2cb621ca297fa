#![allow(dead_code)]

use actix_web::web::Bytes;
use notification_stream::stream::{EventSink, SinkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sink that records every frame and counts close calls
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    closed: AtomicBool,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later write fail, as if the peer silently went away
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Recorded frames whose `event:` line matches `event_type`
    pub fn frames_of(&self, event_type: &str) -> Vec<String> {
        let prefix = format!("event: {}\n", event_type);
        self.frames
            .lock()
            .iter()
            .filter(|frame| frame.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl EventSink for RecordingSink {
    fn write(&self, frame: Bytes) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Disconnected);
        }
        self.frames
            .lock()
            .push(String::from_utf8_lossy(&frame).into_owned());
        Ok(())
    }

    fn close(&self) -> bool {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
