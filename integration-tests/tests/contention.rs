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

use integration_tests::{contender_recipe, exc_key, wait_until, TestEnvironment};
use rheostat_common::model::AwmId;
use rheostat_daemon::model::path::ResourcePath;
use std::collections::HashSet;
use std::time::Duration;
use test_r::test;

#[test]
async fn contending_contexts_share_the_platform_without_overlap() -> anyhow::Result<()> {
    let high = contender_recipe(0);
    let low = contender_recipe(1);
    let env =
        TestEnvironment::start(&[("first-class", &high), ("second-class", &low)]).await?;

    let first = env.connect("first", 101).await?;
    let second = env.connect("second", 102).await?;
    let exc_first = first.register("main", "first-class").await?;
    let exc_second = second.register("main", "second-class").await?;
    exc_first.enable().await?;
    exc_second.enable().await?;

    // Four processing elements, both want three: priority wins, the
    // other falls back.
    let assignment_first = exc_first.get_working_mode().await?;
    let assignment_second = exc_second.get_working_mode().await?;
    assert_eq!(assignment_first.awm_id, 1);
    assert_eq!(assignment_second.awm_id, 0);

    let services = env.services();
    let booked: u64 = (0..4)
        .map(|pe| {
            services
                .accountant
                .usage(&ResourcePath::processing_element(0, 0, pe))
        })
        .sum();
    assert_eq!(booked, 400);

    // No processing element shows up in both control groups.
    let cpus_first: HashSet<u16> = env
        .proxy
        .cgroup_of(exc_key(101, 0))
        .expect("first control group")
        .cpus
        .into_iter()
        .collect();
    let cpus_second: HashSet<u16> = env
        .proxy
        .cgroup_of(exc_key(102, 0))
        .expect("second control group")
        .cpus
        .into_iter()
        .collect();
    assert!(cpus_first.is_disjoint(&cpus_second));

    env.shutdown().await
}

#[test]
async fn a_busy_context_is_dropped_from_the_round_and_retried() -> anyhow::Result<()> {
    let greedy = contender_recipe(0);
    let elastic = contender_recipe(1);
    let env = TestEnvironment::start(&[("greedy", &greedy), ("elastic", &elastic)]).await?;

    let holder = env.connect("holder", 101).await?;
    let exc_holder = holder.register("main", "greedy").await?;
    exc_holder.enable().await?;
    assert_eq!(exc_holder.get_working_mode().await?.awm_id, 1);

    let worker = env.connect("worker", 102).await?;
    let exc_worker = worker.register("main", "elastic").await?;
    exc_worker.enable().await?;
    // Only one processing element left, so the small mode it is.
    assert_eq!(exc_worker.get_working_mode().await?.awm_id, 0);

    let key = exc_key(102, 0);
    let services = env.services().clone();

    // The worker enters a cycle and stays there, so it cannot reach a
    // quiescent point while the upgrade round runs.
    exc_worker.pre_run();

    // Freeing the wide allocation invites an upgrade.
    drop(exc_holder);
    drop(holder);

    // The round must leave the busy worker untouched on its small mode.
    tokio::time::sleep(Duration::from_millis(800)).await;
    {
        let descriptor = services.applications.get(key)?;
        let runtime = descriptor.runtime();
        assert_eq!(runtime.current_awm, Some(AwmId(0)));
    }

    // Once the cycle ends, the next tick retries and the upgrade lands.
    exc_worker.post_run().await?;
    wait_until("worker upgraded to the wide mode", Duration::from_secs(5), || {
        let services = services.clone();
        async move {
            services
                .applications
                .get(key)
                .map(|descriptor| descriptor.runtime().current_awm == Some(AwmId(1)))
                .unwrap_or(false)
        }
    })
    .await;

    env.shutdown().await
}
