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

use integration_tests::{exc_key, wait_until, TestEnvironment, MB, THREE_MODES_RECIPE};
use rheostat_daemon::model::exc::ExcState;
use rheostat_daemon::model::path::ResourcePath;
use std::time::Duration;
use test_r::test;

#[test]
async fn single_context_happy_path() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;

    // One round end to end: the highest-value mode wins.
    let assignment = exc.get_working_mode().await?;
    assert_eq!(assignment.awm_id, 2);
    assert_eq!(assignment.systems.len(), 1);
    assert_eq!(assignment.systems[0].nr_processing_elements, 2);
    assert_eq!(assignment.systems[0].cpu_bandwidth, 200);
    assert_eq!(assignment.systems[0].memory_bytes, 100 * MB);

    let key = exc_key(100, 0);
    let services = env.services();
    assert_eq!(services.applications.get(key)?.state(), ExcState::Running);

    // The ledger carries exactly the granted resources.
    let booked: u64 = (0..4)
        .map(|pe| {
            services
                .accountant
                .usage(&ResourcePath::processing_element(0, 0, pe))
        })
        .sum();
    assert_eq!(booked, 200);
    assert_eq!(
        services.accountant.usage(&ResourcePath::memory_node(0, 0)),
        100 * MB
    );

    // And the control group mirrors the ledger.
    let cgroup = env.proxy.cgroup_of(key).expect("control group exists");
    assert_eq!(cgroup.cpus, vec![0, 1]);
    assert_eq!(cgroup.memory_limit_bytes, Some(100 * MB));
    assert_eq!(cgroup.cfs_period_us, 100_000);
    assert_eq!(cgroup.cfs_quota_us, 200_000);

    env.shutdown().await
}

#[test]
async fn application_death_releases_everything() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;
    exc.get_working_mode().await?;

    let key = exc_key(100, 0);
    assert!(env.proxy.exists(key));

    // Abrupt channel teardown is the death signal.
    drop(exc);
    drop(runtime);

    let services = env.services().clone();
    let proxy = env.proxy.clone();
    wait_until("context finished and resources released", Duration::from_secs(2), || {
        let services = services.clone();
        let proxy = proxy.clone();
        async move {
            services.applications.get(key).is_err()
                && services.accountant.active_booking(key).is_none()
                && !proxy.exists(key)
        }
    })
    .await;
    assert_eq!(
        env.services()
            .accountant
            .usage(&ResourcePath::memory_node(0, 0)),
        0
    );

    env.shutdown().await
}

#[test]
async fn register_then_unregister_restores_the_ledger() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let before = env.services().accountant.active_used_sum();

    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;
    exc.get_working_mode().await?;
    assert!(env.services().accountant.active_used_sum() > before);

    exc.unregister().await?;
    let services = env.services().clone();
    wait_until("ledger back to its pre-registration state", Duration::from_secs(2), || {
        let services = services.clone();
        async move { services.accountant.active_used_sum() == before }
    })
    .await;

    runtime.exit().await?;
    env.shutdown().await
}
