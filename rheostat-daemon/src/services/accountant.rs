// Copyright 2025 Rheostat Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The resource ledger: the single source of truth for "who holds what".
//!
//! All mutation happens under the internal lock and becomes visible to
//! other components only after the call returns. Tentative allocation goes
//! through named views: `make_view` clones the active allocation columns,
//! the policy books into the clone, and `promote` swaps it into the active
//! slot. Promotion invalidates every other outstanding token through an
//! epoch counter, so no writer can keep mutating a superseded view.

use crate::metrics;
use crate::model::path::ResourcePath;
use crate::model::resource::{AssignmentMap, ResourceDescriptor};
use rheostat_common::model::ExcKey;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    #[error("platform description is not ready")]
    PlatformNotReady,
    #[error("resource registration after the platform was marked ready")]
    PlatformAlreadyReady,
    #[error("resource {0} is already registered")]
    AlreadyRegistered(ResourcePath),
    #[error("unknown resource {0}")]
    UnknownResource(ResourcePath),
    #[error("insufficient resources on {0}")]
    InsufficientResources(ResourcePath),
    #[error("reservation on {0} would cut into committed usage")]
    InvalidReservation(ResourcePath),
    #[error("view token {0:?} does not name a live view")]
    UnknownView(ViewToken),
    #[error("view token {0:?} is stale, the view generation has moved on")]
    StaleView(ViewToken),
}

/// Opaque handle to a view. Carries the epoch it was minted in; any
/// promotion bumps the epoch and strands older tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewToken {
    id: u64,
    epoch: u64,
}

#[derive(Debug, Clone)]
struct ResourceInfo {
    total: u64,
    reserved: u64,
}

#[derive(Debug, Clone, Default)]
struct Booking {
    map: AssignmentMap,
    exclusive: bool,
}

#[derive(Debug, Clone)]
struct View {
    name: String,
    used: BTreeMap<ResourcePath, u64>,
    bookings: HashMap<ExcKey, Booking>,
}

#[derive(Debug)]
struct Ledger {
    ready: bool,
    epoch: u64,
    next_view_id: u64,
    resources: BTreeMap<ResourcePath, ResourceInfo>,
    views: HashMap<u64, View>,
    active_id: u64,
}

impl Ledger {
    fn check_token(&self, token: ViewToken) -> Result<(), AccountingError> {
        if token.epoch != self.epoch {
            return Err(AccountingError::StaleView(token));
        }
        if !self.views.contains_key(&token.id) {
            return Err(AccountingError::UnknownView(token));
        }
        Ok(())
    }

    fn remove_booking(view: &mut View, exc: ExcKey) -> Option<Booking> {
        let booking = view.bookings.remove(&exc)?;
        for (path, quantity) in &booking.map {
            if let Some(used) = view.used.get_mut(path) {
                *used = used.saturating_sub(*quantity);
            }
        }
        Some(booking)
    }
}

#[derive(Debug)]
pub struct ResourceAccountant {
    ledger: Mutex<Ledger>,
}

impl Default for ResourceAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceAccountant {
    pub fn new() -> Self {
        let active = View {
            name: "active".to_string(),
            used: BTreeMap::new(),
            bookings: HashMap::new(),
        };
        let mut views = HashMap::new();
        views.insert(0, active);
        Self {
            ledger: Mutex::new(Ledger {
                ready: false,
                epoch: 0,
                next_view_id: 1,
                resources: BTreeMap::new(),
                views,
                active_id: 0,
            }),
        }
    }

    /// Registers a resource during platform enumeration. Refused once the
    /// platform has been marked ready.
    pub fn register(&self, path: ResourcePath, total: u64) -> Result<(), AccountingError> {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.ready {
            return Err(AccountingError::PlatformAlreadyReady);
        }
        if ledger.resources.contains_key(&path) {
            return Err(AccountingError::AlreadyRegistered(path));
        }
        ledger
            .resources
            .insert(path, ResourceInfo { total, reserved: 0 });
        Ok(())
    }

    /// Administratively withholds part of a resource's capacity.
    pub fn set_reserved(&self, path: &ResourcePath, reserved: u64) -> Result<(), AccountingError> {
        let mut ledger = self.ledger.lock().unwrap();
        let active_id = ledger.active_id;
        let used = ledger.views[&active_id]
            .used
            .get(path)
            .copied()
            .unwrap_or(0);
        let info = ledger
            .resources
            .get_mut(path)
            .ok_or_else(|| AccountingError::UnknownResource(path.clone()))?;
        if used + reserved > info.total {
            return Err(AccountingError::InvalidReservation(path.clone()));
        }
        info.reserved = reserved;
        Ok(())
    }

    pub fn set_platform_ready(&self) {
        self.ledger.lock().unwrap().ready = true;
    }

    /// Freezes the ledger during a platform refresh: booking calls fail
    /// with `PlatformNotReady` until readiness is restored.
    pub fn set_platform_not_ready(&self) {
        self.ledger.lock().unwrap().ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ledger.lock().unwrap().ready
    }

    /// Concrete resources matching a (possibly wildcarded) path, with
    /// usage from the active view.
    pub fn resources_matching(&self, pattern: &ResourcePath) -> Vec<ResourceDescriptor> {
        let ledger = self.ledger.lock().unwrap();
        let active = &ledger.views[&ledger.active_id];
        ledger
            .resources
            .iter()
            .filter(|(path, _)| path.matches(pattern))
            .map(|(path, info)| ResourceDescriptor {
                path: path.clone(),
                total: info.total,
                reserved: info.reserved,
                used: active.used.get(path).copied().unwrap_or(0),
            })
            .collect()
    }

    /// Like `resources_matching`, but with usage taken from the given
    /// view instead of the active one.
    pub fn resources_matching_in(
        &self,
        token: ViewToken,
        pattern: &ResourcePath,
    ) -> Result<Vec<ResourceDescriptor>, AccountingError> {
        let ledger = self.ledger.lock().unwrap();
        ledger.check_token(token)?;
        let view = &ledger.views[&token.id];
        Ok(ledger
            .resources
            .iter()
            .filter(|(path, _)| path.matches(pattern))
            .map(|(path, info)| ResourceDescriptor {
                path: path.clone(),
                total: info.total,
                reserved: info.reserved,
                used: view.used.get(path).copied().unwrap_or(0),
            })
            .collect())
    }

    /// Clones the active view's allocation columns into a new tentative
    /// view and returns its token.
    pub fn make_view(&self, name: &str) -> ViewToken {
        let mut ledger = self.ledger.lock().unwrap();
        let clone = View {
            name: name.to_string(),
            ..ledger.views[&ledger.active_id].clone()
        };
        let id = ledger.next_view_id;
        ledger.next_view_id += 1;
        ledger.views.insert(id, clone);
        ViewToken {
            id,
            epoch: ledger.epoch,
        }
    }

    /// Books an assignment map for an execution context into the named
    /// view. Atomic: either every entry fits or nothing is recorded. A
    /// previous booking of the same context in this view is replaced.
    pub fn book(
        &self,
        token: ViewToken,
        exc: ExcKey,
        assignment: &AssignmentMap,
        exclusive: bool,
    ) -> Result<(), AccountingError> {
        let mut ledger = self.ledger.lock().unwrap();
        if !ledger.ready {
            return Err(AccountingError::PlatformNotReady);
        }
        ledger.check_token(token)?;

        // Validate against the view as it would look without this
        // context's previous booking.
        let previous = ledger.views[&token.id].bookings.get(&exc).cloned();
        for (path, quantity) in assignment {
            let info = ledger
                .resources
                .get(path)
                .ok_or_else(|| AccountingError::UnknownResource(path.clone()))?
                .clone();
            let mut used = ledger.views[&token.id]
                .used
                .get(path)
                .copied()
                .unwrap_or(0);
            if let Some(previous) = &previous {
                used = used.saturating_sub(previous.map.get(path).copied().unwrap_or(0));
            }
            if used + quantity + info.reserved > info.total {
                metrics::record_booking_rejected();
                return Err(AccountingError::InsufficientResources(path.clone()));
            }
        }

        let view = ledger.views.get_mut(&token.id).unwrap();
        Ledger::remove_booking(view, exc);
        for (path, quantity) in assignment {
            *view.used.entry(path.clone()).or_insert(0) += quantity;
        }
        view.bookings.insert(
            exc,
            Booking {
                map: assignment.clone(),
                exclusive,
            },
        );
        Ok(())
    }

    /// Removes any booking owned by the context from the named view.
    pub fn unbook(&self, token: ViewToken, exc: ExcKey) -> Result<(), AccountingError> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.check_token(token)?;
        let view = ledger.views.get_mut(&token.id).unwrap();
        Ledger::remove_booking(view, exc);
        Ok(())
    }

    /// Atomically swaps the view into the active slot. Every other
    /// outstanding token becomes stale; the previous active view is
    /// reclaimed.
    pub fn promote(&self, token: ViewToken) -> Result<(), AccountingError> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.check_token(token)?;
        let old_active = ledger.active_id;
        ledger.active_id = token.id;
        ledger.epoch += 1;
        if old_active != token.id {
            ledger.views.remove(&old_active);
        }
        // Tentative views from the finished round are dead weight now.
        let active_id = ledger.active_id;
        ledger.views.retain(|id, _| *id == active_id);
        let name = &ledger.views[&active_id].name;
        debug!(view = %name, "promoted scheduling view to active");
        Ok(())
    }

    /// Drops a tentative view without promoting it. Discarding a stale or
    /// already-reclaimed token is a no-op.
    pub fn discard(&self, token: ViewToken) {
        let mut ledger = self.ledger.lock().unwrap();
        if token.epoch == ledger.epoch && token.id != ledger.active_id {
            ledger.views.remove(&token.id);
        }
    }

    /// The context's booking in the active view, if any.
    pub fn active_booking(&self, exc: ExcKey) -> Option<AssignmentMap> {
        let ledger = self.ledger.lock().unwrap();
        ledger.views[&ledger.active_id]
            .bookings
            .get(&exc)
            .map(|booking| booking.map.clone())
    }

    /// Removes the context's bookings from every live view. Called when a
    /// context reaches FINISHED; afterwards no view holds anything for it.
    pub fn release_exc(&self, exc: ExcKey) {
        let mut ledger = self.ledger.lock().unwrap();
        for view in ledger.views.values_mut() {
            Ledger::remove_booking(view, exc);
        }
    }

    pub fn usage(&self, path: &ResourcePath) -> u64 {
        let ledger = self.ledger.lock().unwrap();
        ledger.views[&ledger.active_id]
            .used
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self, path: &ResourcePath) -> Option<u64> {
        self.ledger
            .lock()
            .unwrap()
            .resources
            .get(path)
            .map(|info| info.total)
    }

    /// Sum of booked quantities across the active view, for coarse
    /// diagnostics.
    pub fn active_used_sum(&self) -> u64 {
        let ledger = self.ledger.lock().unwrap();
        ledger.views[&ledger.active_id].used.values().sum()
    }

    /// Verifies `used + reserved <= total` for every resource in every
    /// view. Cheap enough to run after each round in debug builds.
    pub fn check_consistency(&self) -> Result<(), AccountingError> {
        let ledger = self.ledger.lock().unwrap();
        for view in ledger.views.values() {
            for (path, used) in &view.used {
                let info = ledger
                    .resources
                    .get(path)
                    .ok_or_else(|| AccountingError::UnknownResource(path.clone()))?;
                if used + info.reserved > info.total {
                    return Err(AccountingError::InsufficientResources(path.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Write access to one view, handed to the policy. Every mutation goes
/// through the accountant and is checked against the accounting
/// invariants.
pub struct ViewHandle<'a> {
    accountant: &'a ResourceAccountant,
    token: ViewToken,
}

impl<'a> ViewHandle<'a> {
    pub fn new(accountant: &'a ResourceAccountant, token: ViewToken) -> Self {
        Self { accountant, token }
    }

    pub fn token(&self) -> ViewToken {
        self.token
    }

    pub fn book(
        &mut self,
        exc: ExcKey,
        assignment: &AssignmentMap,
        exclusive: bool,
    ) -> Result<(), AccountingError> {
        self.accountant.book(self.token, exc, assignment, exclusive)
    }

    pub fn unbook(&mut self, exc: ExcKey) -> Result<(), AccountingError> {
        self.accountant.unbook(self.token, exc)
    }

    /// Concrete resources matching a pattern, with usage as this view
    /// sees it. This is what policies bind wildcard demands against.
    pub fn resources_matching(
        &self,
        pattern: &ResourcePath,
    ) -> Result<Vec<ResourceDescriptor>, AccountingError> {
        self.accountant.resources_matching_in(self.token, pattern)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use rheostat_common::model::{AppPid, ExcId};

    fn pe(index: u16) -> ResourcePath {
        ResourcePath::processing_element(0, 0, index)
    }

    fn exc(id: u8) -> ExcKey {
        ExcKey::new(AppPid(1000), ExcId(id))
    }

    fn ready_accountant() -> ResourceAccountant {
        let accountant = ResourceAccountant::new();
        for index in 0..4 {
            accountant.register(pe(index), 100).unwrap();
        }
        accountant
            .register(ResourcePath::memory_node(0, 0), 1024)
            .unwrap();
        accountant.set_platform_ready();
        accountant
    }

    fn assignment(entries: &[(ResourcePath, u64)]) -> AssignmentMap {
        entries.iter().cloned().collect()
    }

    #[test]
    fn registration_is_refused_once_ready() {
        let accountant = ready_accountant();
        assert!(matches!(
            accountant.register(pe(9), 100),
            Err(AccountingError::PlatformAlreadyReady)
        ));
    }

    #[test]
    fn booking_to_capacity_succeeds_and_one_more_unit_fails_cleanly() {
        let accountant = ready_accountant();
        let view = accountant.make_view("scheduled");

        accountant
            .book(view, exc(0), &assignment(&[(pe(0), 100)]), false)
            .unwrap();

        // The second booking would overflow pe0; nothing of it may stick.
        let overflowing = assignment(&[(pe(1), 100), (pe(0), 1)]);
        let error = accountant
            .book(view, exc(1), &overflowing, false)
            .unwrap_err();
        assert!(matches!(error, AccountingError::InsufficientResources(_)));
        accountant.promote(view).unwrap();
        assert_eq!(accountant.usage(&pe(1)), 0);
        assert_eq!(accountant.usage(&pe(0)), 100);
    }

    #[test]
    fn promotion_invalidates_other_tokens() {
        let accountant = ready_accountant();
        let winner = accountant.make_view("round-1");
        let loser = accountant.make_view("what-if");
        accountant.promote(winner).unwrap();
        assert!(matches!(
            accountant.book(loser, exc(0), &assignment(&[(pe(0), 1)]), false),
            Err(AccountingError::StaleView(_))
        ));
    }

    #[test]
    fn empty_view_promotion_is_an_accounting_noop() {
        let accountant = ready_accountant();
        let seed = accountant.make_view("seed");
        accountant
            .book(seed, exc(0), &assignment(&[(pe(0), 100)]), false)
            .unwrap();
        accountant.promote(seed).unwrap();

        let before: Vec<u64> = (0..4).map(|index| accountant.usage(&pe(index))).collect();
        let view = accountant.make_view("noop");
        accountant.promote(view).unwrap();
        let after: Vec<u64> = (0..4).map(|index| accountant.usage(&pe(index))).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn release_clears_every_view() {
        let accountant = ready_accountant();
        let view = accountant.make_view("scheduled");
        accountant
            .book(view, exc(0), &assignment(&[(pe(0), 100), (pe(1), 100)]), false)
            .unwrap();
        accountant.promote(view).unwrap();
        assert_eq!(accountant.usage(&pe(0)), 100);

        accountant.release_exc(exc(0));
        assert_eq!(accountant.usage(&pe(0)), 0);
        assert_eq!(accountant.usage(&pe(1)), 0);
        assert!(accountant.active_booking(exc(0)).is_none());
        accountant.check_consistency().unwrap();
    }

    #[test]
    fn booking_fails_while_platform_is_frozen() {
        let accountant = ready_accountant();
        let view = accountant.make_view("scheduled");
        accountant.set_platform_not_ready();
        assert!(matches!(
            accountant.book(view, exc(0), &assignment(&[(pe(0), 1)]), false),
            Err(AccountingError::PlatformNotReady)
        ));
    }

    #[test]
    fn rebooking_replaces_the_previous_booking() {
        let accountant = ready_accountant();
        let view = accountant.make_view("scheduled");
        accountant
            .book(view, exc(0), &assignment(&[(pe(0), 100)]), false)
            .unwrap();
        accountant
            .book(view, exc(0), &assignment(&[(pe(1), 100)]), false)
            .unwrap();
        accountant.promote(view).unwrap();
        assert_eq!(accountant.usage(&pe(0)), 0);
        assert_eq!(accountant.usage(&pe(1)), 100);
    }

    #[test]
    fn reservations_shrink_the_bookable_capacity() {
        let accountant = ready_accountant();
        accountant.set_reserved(&pe(0), 40).unwrap();
        let view = accountant.make_view("scheduled");
        assert!(matches!(
            accountant.book(view, exc(0), &assignment(&[(pe(0), 70)]), false),
            Err(AccountingError::InsufficientResources(_))
        ));
        accountant
            .book(view, exc(0), &assignment(&[(pe(0), 60)]), false)
            .unwrap();
    }
}
