// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client interface to the hierarchical configuration tree shared between
//! the host and its guests.
//!
//! The tree supports transactional multi-op updates (atomic or fully
//! retried), per-node guest permissions, and watches coalesced by path.
//! `NotFound` is a distinct outcome from I/O failure: the engine routinely
//! probes for absent nodes and must not confuse the two.
//!
//! [`MemStore`] is a complete in-process implementation with the same
//! semantics as the host daemon, including the synthetic
//! `@introduceDomain`/`@releaseDomain` events; it backs the test suite and
//! embedded deployments.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DomId;

/// Special watch path fired when a domain is introduced to the tree.
pub const INTRODUCE_DOMAIN: &str = "@introduceDomain";
/// Special watch path fired when a domain releases the tree.
pub const RELEASE_DOMAIN: &str = "@releaseDomain";

const TX_MAX_RETRIES: usize = 16;

/// Guest access level on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Perm {
    /// No guest access.
    None,
    /// Guest may read.
    Read,
    /// Guest may write.
    Write,
    /// Guest may read and write.
    ReadWrite,
}

/// Node permissions: the owning domain has full access, all other domains
/// get `others`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    /// Owning domain.
    pub owner: DomId,
    /// Access granted to every other domain.
    pub others: Perm,
}

/// A delivered watch notification: the path that changed (or the watched
/// path itself for the registration event) plus the registration token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Path the event fired for.
    pub path: String,
    /// Token given at registration.
    pub token: String,
}

/// Errors from tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum StoreError {
    /// Path not present: {0}
    NotFound(String),
    /// Transaction kept conflicting and exhausted its retries
    Conflict,
    /// Operation not valid inside a transaction
    InTransaction,
    /// Tree I/O failure: {0}
    Io(String),
}

/// Operations every tree client exposes.
pub trait Store: Send + Sync {
    /// Reads the value at `path`; directories read as the empty string.
    fn read(&self, path: &str) -> Result<String, StoreError>;
    /// Writes `value` at `path`, creating intermediate nodes.
    fn write(&self, path: &str, value: &str) -> Result<(), StoreError>;
    /// Creates a directory node.
    fn mkdir(&self, path: &str) -> Result<(), StoreError>;
    /// Removes the subtree rooted at `path`.
    fn rm(&self, path: &str) -> Result<(), StoreError>;
    /// Lists the child names of `path`.
    fn directory(&self, path: &str) -> Result<Vec<String>, StoreError>;
    /// Sets node permissions.
    fn setperms(&self, path: &str, perms: &Perms) -> Result<(), StoreError>;
    /// Reads several paths in one round trip.
    fn read_v(&self, paths: &[&str]) -> Result<Vec<String>, StoreError> {
        paths.iter().map(|p| self.read(p)).collect()
    }
    /// Writes several pairs in one round trip.
    fn write_v(&self, pairs: &[(&str, &str)]) -> Result<(), StoreError> {
        for (path, value) in pairs {
            self.write(path, value)?;
        }
        Ok(())
    }
    /// Registers a watch on `path` (or a special `@` path) with `token`.
    /// Registration fires one synthetic event.
    fn watch(&self, path: &str, token: &str) -> Result<(), StoreError>;
    /// Removes a watch registration.
    fn unwatch(&self, path: &str, token: &str) -> Result<(), StoreError>;
    /// Runs `f` against a transaction view: either every operation commits
    /// atomically, or the whole closure is retried on conflict.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Store) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
    /// Blocks up to `timeout` for the next coalesced watch event.
    fn next_watch_event(&self, timeout: Duration) -> Result<Option<WatchEvent>, StoreError>;
}

/// Reads a path, mapping `NotFound` to `None`.
pub fn read_opt(store: &dyn Store, path: &str) -> Result<Option<String>, StoreError> {
    match store.read(path) {
        Ok(v) => Ok(Some(v)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes a subtree, ignoring its absence.
pub fn rm_if_present(store: &dyn Store, path: &str) -> Result<(), StoreError> {
    match store.rm(path) {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Well-known tree locations.
pub mod paths {
    use crate::{DomId, VmId};

    /// Per-domain root.
    pub fn domain(domid: DomId) -> String {
        format!("/local/domain/{}", domid)
    }

    /// Per-VM root, preserved across reboots of the same VM.
    pub fn vm(vm: &VmId) -> String {
        format!("/vm/{}", vm)
    }

    /// RTC offset node, kept under the VM root so it survives the domain.
    pub fn rtc_timeoffset(vm: &VmId) -> String {
        format!("/vm/{}/rtc/timeoffset", vm)
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    value: Option<String>,
    perms: Option<Perms>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn lookup(&self, parts: &[&str]) -> Option<&Node> {
        match parts.split_first() {
            None => Some(self),
            Some((head, rest)) => self.children.get(*head).and_then(|c| c.lookup(rest)),
        }
    }

    fn lookup_mut(&mut self, parts: &[&str]) -> Option<&mut Node> {
        match parts.split_first() {
            None => Some(self),
            Some((head, rest)) => self.children.get_mut(*head).and_then(|c| c.lookup_mut(rest)),
        }
    }

    fn ensure(&mut self, parts: &[&str]) -> &mut Node {
        match parts.split_first() {
            None => self,
            Some((head, rest)) => self
                .children
                .entry((*head).to_string())
                .or_default()
                .ensure(rest),
        }
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

#[derive(Debug, Default)]
struct TreeState {
    root: Node,
    generation: u64,
    watches: Vec<(String, String)>,
    pending: VecDeque<WatchEvent>,
}

impl TreeState {
    // A change at `path` notifies watches on the path itself and on any
    // ancestor directory, coalesced per (path, token).
    fn fire(&mut self, path: &str) {
        let mut fired = Vec::new();
        for (watched, token) in &self.watches {
            if watched.starts_with('@') {
                if watched == path {
                    fired.push(WatchEvent {
                        path: path.to_string(),
                        token: token.clone(),
                    });
                }
            } else if path == watched || path.starts_with(&format!("{}/", watched)) {
                fired.push(WatchEvent {
                    path: path.to_string(),
                    token: token.clone(),
                });
            }
        }
        for event in fired {
            if !self.pending.contains(&event) {
                self.pending.push_back(event);
            }
        }
    }
}

/// In-process implementation of [`Store`].
#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<TreeState>,
    cond: Condvar,
}

impl MemStore {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires a special `@` event, as the host daemon does when the
    /// hypervisor introduces or releases a domain.
    pub fn fire_special(&self, name: &str) {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.fire(name);
        self.cond.notify_all();
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut TreeState) -> Result<(T, Vec<String>), StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let (out, touched) = f(&mut state)?;
        state.generation += 1;
        for path in touched {
            state.fire(&path);
        }
        self.cond.notify_all();
        Ok(out)
    }
}

fn tree_read(root: &Node, path: &str) -> Result<String, StoreError> {
    root.lookup(&split(path))
        .map(|n| n.value.clone().unwrap_or_default())
        .ok_or_else(|| StoreError::NotFound(path.to_string()))
}

fn tree_write(root: &mut Node, path: &str, value: &str) {
    root.ensure(&split(path)).value = Some(value.to_string());
}

fn tree_rm(root: &mut Node, path: &str) -> Result<(), StoreError> {
    let parts = split(path);
    let Some((leaf, dir)) = parts.split_last() else {
        return Err(StoreError::NotFound(path.to_string()));
    };
    let parent = root
        .lookup_mut(dir)
        .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
    parent
        .children
        .remove(*leaf)
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(path.to_string()))
}

fn tree_directory(root: &Node, path: &str) -> Result<Vec<String>, StoreError> {
    root.lookup(&split(path))
        .map(|n| n.children.keys().cloned().collect())
        .ok_or_else(|| StoreError::NotFound(path.to_string()))
}

impl Store for MemStore {
    fn read(&self, path: &str) -> Result<String, StoreError> {
        let state = self.state.lock().expect("store lock poisoned");
        tree_read(&state.root, path)
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            tree_write(&mut state.root, path, value);
            Ok(((), vec![path.to_string()]))
        })
    }

    fn mkdir(&self, path: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.root.ensure(&split(path));
            Ok(((), vec![path.to_string()]))
        })
    }

    fn rm(&self, path: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            tree_rm(&mut state.root, path)?;
            Ok(((), vec![path.to_string()]))
        })
    }

    fn directory(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().expect("store lock poisoned");
        tree_directory(&state.root, path)
    }

    fn setperms(&self, path: &str, perms: &Perms) -> Result<(), StoreError> {
        self.mutate(|state| {
            let node = state
                .root
                .lookup_mut(&split(path))
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            node.perms = Some(*perms);
            Ok(((), Vec::new()))
        })
    }

    fn watch(&self, path: &str, token: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let reg = (path.to_string(), token.to_string());
        if !state.watches.contains(&reg) {
            state.watches.push(reg);
        }
        // Registration fires one synthetic event so consumers start from
        // the current state; they are expected to be idempotent.
        let event = WatchEvent {
            path: path.to_string(),
            token: token.to_string(),
        };
        if !state.pending.contains(&event) {
            state.pending.push_back(event);
        }
        self.cond.notify_all();
        Ok(())
    }

    fn unwatch(&self, path: &str, token: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let before = state.watches.len();
        state.watches.retain(|(p, t)| !(p == path && t == token));
        if state.watches.len() == before {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Store) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        for _ in 0..TX_MAX_RETRIES {
            let (snapshot, start_generation) = {
                let state = self.state.lock().expect("store lock poisoned");
                (state.root.clone(), state.generation)
            };
            let view = TxView {
                state: Mutex::new(TxState {
                    root: snapshot,
                    touched: Vec::new(),
                }),
            };
            f(&view)?;
            let tx = view.state.into_inner().expect("tx lock poisoned");

            let mut state = self.state.lock().expect("store lock poisoned");
            if state.generation != start_generation {
                continue;
            }
            state.root = tx.root;
            state.generation += 1;
            for path in tx.touched {
                state.fire(&path);
            }
            self.cond.notify_all();
            return Ok(());
        }
        Err(StoreError::Conflict)
    }

    fn next_watch_event(&self, timeout: Duration) -> Result<Option<WatchEvent>, StoreError> {
        let mut state = self.state.lock().expect("store lock poisoned");
        if state.pending.is_empty() {
            let (next, _timed_out) = self
                .cond
                .wait_timeout(state, timeout)
                .expect("store lock poisoned");
            state = next;
        }
        Ok(state.pending.pop_front())
    }
}

#[derive(Debug)]
struct TxState {
    root: Node,
    touched: Vec<String>,
}

// Transaction view: operates on a snapshot, records touched paths for the
// commit-time watch fanout.
#[derive(Debug)]
struct TxView {
    state: Mutex<TxState>,
}

impl Store for TxView {
    fn read(&self, path: &str) -> Result<String, StoreError> {
        let state = self.state.lock().expect("tx lock poisoned");
        tree_read(&state.root, path)
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("tx lock poisoned");
        tree_write(&mut state.root, path, value);
        state.touched.push(path.to_string());
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("tx lock poisoned");
        state.root.ensure(&split(path));
        state.touched.push(path.to_string());
        Ok(())
    }

    fn rm(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("tx lock poisoned");
        tree_rm(&mut state.root, path)?;
        state.touched.push(path.to_string());
        Ok(())
    }

    fn directory(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().expect("tx lock poisoned");
        tree_directory(&state.root, path)
    }

    fn setperms(&self, path: &str, perms: &Perms) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("tx lock poisoned");
        let node = state
            .root
            .lookup_mut(&split(path))
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        node.perms = Some(*perms);
        Ok(())
    }

    fn watch(&self, _path: &str, _token: &str) -> Result<(), StoreError> {
        Err(StoreError::InTransaction)
    }

    fn unwatch(&self, _path: &str, _token: &str) -> Result<(), StoreError> {
        Err(StoreError::InTransaction)
    }

    fn transaction(
        &self,
        _f: &mut dyn FnMut(&dyn Store) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        Err(StoreError::InTransaction)
    }

    fn next_watch_event(&self, _timeout: Duration) -> Result<Option<WatchEvent>, StoreError> {
        Err(StoreError::InTransaction)
    }
}
