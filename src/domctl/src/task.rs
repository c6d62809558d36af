// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Task annotations consumed by the engine.
//!
//! The persistent task table and its RPC surface live outside this crate;
//! the engine only needs a handle it can report progress through, a way to
//! name the sub-operation it is in, and a cancellation flag it checks at
//! every suspension point. Cancellation is cooperative: a tripped checkpoint
//! returns `Cancelled` and the caller runs the same cleanup path as for any
//! other failure.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    // 0 means no trip point; N trips the Nth cancellation checkpoint.
    cancel_trip_point: AtomicU32,
    checkpoints: AtomicU32,
    progress: AtomicU32,
    subtask: Mutex<Option<String>>,
}

/// A cloneable handle onto one task of the external task table.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    id: String,
    inner: Arc<Inner>,
}

impl TaskHandle {
    /// Creates a handle with the given external task id.
    pub fn new(id: impl Into<String>) -> Self {
        TaskHandle {
            id: id.into(),
            inner: Arc::default(),
        }
    }

    /// The external task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests cooperative cancellation; takes effect at the next
    /// checkpoint.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Arms a trip point: the `n`th cancellation checkpoint from now will
    /// cancel the task. Used by the debug surface to exercise cleanup paths.
    pub fn set_cancel_trip_point(&self, n: u32) {
        self.inner.checkpoints.store(0, Ordering::SeqCst);
        self.inner.cancel_trip_point.store(n, Ordering::SeqCst);
    }

    /// Cancellation checkpoint. Every wait and progress loop in the engine
    /// passes through here.
    pub fn check_cancel(&self) -> Result<()> {
        let seen = self.inner.checkpoints.fetch_add(1, Ordering::SeqCst) + 1;
        let trip = self.inner.cancel_trip_point.load(Ordering::SeqCst);
        if trip != 0 && seen >= trip {
            self.cancel();
        }
        if self.inner.cancelled.load(Ordering::SeqCst) {
            debug!("task {}: cancelled at checkpoint {}", self.id, seen);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Reports progress in percent; values above 100 are clamped.
    pub fn set_progress(&self, percent: u32) {
        self.inner.progress.store(percent.min(100), Ordering::SeqCst);
    }

    /// Last reported progress in percent.
    pub fn progress(&self) -> u32 {
        self.inner.progress.load(Ordering::SeqCst)
    }

    /// Runs `f` annotated as a named subtask.
    pub fn subtask<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        debug!("task {}: subtask {} started", self.id, name);
        *self.inner.subtask.lock().expect("task lock poisoned") = Some(name.to_string());
        let result = f();
        *self.inner.subtask.lock().expect("task lock poisoned") = None;
        match &result {
            Ok(_) => debug!("task {}: subtask {} finished", self.id, name),
            Err(e) => debug!("task {}: subtask {} failed: {}", self.id, name, e),
        }
        result
    }

    /// The currently executing subtask, if any.
    pub fn current_subtask(&self) -> Option<String> {
        self.inner.subtask.lock().expect("task lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_cooperative() {
        let task = TaskHandle::new("t1");
        assert!(task.check_cancel().is_ok());
        task.cancel();
        assert_eq!(task.check_cancel(), Err(Error::Cancelled));
    }

    #[test]
    fn test_trip_point() {
        let task = TaskHandle::new("t2");
        task.set_cancel_trip_point(3);
        assert!(task.check_cancel().is_ok());
        assert!(task.check_cancel().is_ok());
        assert_eq!(task.check_cancel(), Err(Error::Cancelled));
    }

    #[test]
    fn test_progress_clamped() {
        let task = TaskHandle::new("t3");
        task.set_progress(250);
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn test_subtask_annotation_clears() {
        let task = TaskHandle::new("t4");
        let out = task.subtask("attach", || {
            assert_eq!(task.current_subtask().as_deref(), Some("attach"));
            Ok(7)
        });
        assert_eq!(out, Ok(7));
        assert!(task.current_subtask().is_none());
    }
}
