// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines dependency handles and readiness flags operators expose while
//!   waiting on background work (e.g. an in-flight spill write).
//! - Used by drivers to park a blocked operator and resume it on notification.
//!
//! Key exported interfaces:
//! - Types: `DependencyHandle`, `Dependency`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::exec::pipeline::observer::{Observable, Observer};
use crate::quartzite_logging::trace;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Dependency primitive used to model blocked/unblocked execution conditions.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observable: Arc<Observable>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn create(name: impl Into<String>) -> DependencyHandle {
        Arc::new(Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if !prev {
            let notify = self.observable.defer_notify();
            notify.arm();
            trace!(
                "dependency ready: dep_id={} name={} observers={}",
                self.id,
                self.name,
                self.observable.num_observers()
            );
        }
    }

    pub fn set_blocked(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Register a callback fired when the dependency becomes ready.
    ///
    /// If readiness races with registration the callback is still delivered,
    /// possibly twice; waiters must tolerate spurious wakeups.
    pub fn add_waiter(&self, observer: Observer) {
        if self.is_ready() {
            observer();
            return;
        }
        self.observable.add_observer(observer);
        if self.is_ready() {
            let notify = self.observable.defer_notify();
            notify.arm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn waiter_added_after_ready_fires_immediately() {
        let dep = Dependency::create("test_dep");
        dep.set_ready();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        dep.add_waiter(Arc::new(move || {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ready_transition_notifies_registered_waiters() {
        let dep = Dependency::create("test_dep");
        assert!(!dep.is_ready());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        dep.add_waiter(Arc::new(move || {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        dep.set_ready();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // A second set_ready is a no-op.
        dep.set_ready();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocked_resets_readiness() {
        let dep = Dependency::create("test_dep");
        dep.set_ready();
        assert!(dep.is_ready());
        dep.set_blocked();
        assert!(!dep.is_ready());
    }
}
