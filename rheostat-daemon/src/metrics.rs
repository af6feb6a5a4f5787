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

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
};

lazy_static! {
    static ref SCHEDULING_ROUNDS_TOTAL: IntCounter = register_int_counter!(
        "scheduling_rounds_total",
        "Number of scheduling rounds executed"
    )
    .unwrap();
    static ref SCHEDULING_ROUND_SECONDS: Histogram = register_histogram!(histogram_opts!(
        "scheduling_round_seconds",
        "Wall time of a scheduling round, policy plus synchronization"
    ))
    .unwrap();
    static ref SYNC_PHASE_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_phase_outcomes_total",
        "Per-phase outcomes of the synchronization protocol",
        &["phase", "outcome"]
    )
    .unwrap();
    static ref BOOKINGS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "bookings_rejected_total",
        "Resource bookings rejected for insufficient resources"
    )
    .unwrap();
    static ref APPLICATIONS_PAIRED_TOTAL: IntCounter = register_int_counter!(
        "applications_paired_total",
        "Applications that completed channel pairing"
    )
    .unwrap();
    static ref APPLICATIONS_DEPARTED_TOTAL: IntCounter = register_int_counter!(
        "applications_departed_total",
        "Applications that exited or whose channel dropped"
    )
    .unwrap();
    static ref EXECUTION_CONTEXTS: IntGauge = register_int_gauge!(
        "execution_contexts",
        "Execution contexts currently registered"
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    prometheus::default_registry().clone()
}

pub fn record_scheduling_round(elapsed: std::time::Duration) {
    SCHEDULING_ROUNDS_TOTAL.inc();
    SCHEDULING_ROUND_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_sync_phase_outcome(phase: &'static str, outcome: &'static str) {
    SYNC_PHASE_OUTCOMES_TOTAL
        .with_label_values(&[phase, outcome])
        .inc();
}

pub fn record_booking_rejected() {
    BOOKINGS_REJECTED_TOTAL.inc();
}

pub fn record_application_paired() {
    APPLICATIONS_PAIRED_TOTAL.inc();
}

pub fn record_application_departed() {
    APPLICATIONS_DEPARTED_TOTAL.inc();
}

pub fn record_exc_registered() {
    EXECUTION_CONTEXTS.inc();
}

pub fn record_exc_finished() {
    EXECUTION_CONTEXTS.dec();
}
