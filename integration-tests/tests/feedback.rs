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

use integration_tests::{exc_key, TestEnvironment, THREE_MODES_RECIPE};
use std::time::Duration;
use test_r::test;

#[test]
async fn a_missed_cps_goal_raises_a_full_goal_gap() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;
    exc.get_working_mode().await?;

    // Goal 30..60 cycles per second, delivered: 20. The gap saturates at
    // +100% once the post-reconfiguration rearm window has passed.
    exc.set_cps_goal(30.0, 60.0);
    let key = exc_key(100, 0);
    let mut notified = false;
    for _ in 0..40 {
        exc.pre_run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        exc.post_run().await?;
        if let Some(statistics) = env.services().applications.statistics(key) {
            if statistics.notifications > 0 {
                notified = true;
                break;
            }
        }
    }
    assert!(notified, "no runtime profile notification arrived");

    // Give the daemon a beat to store the profile.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let descriptor = env.services().applications.get(key)?;
    let profile = descriptor.runtime().profile;
    assert!(profile.valid);
    assert_eq!(profile.goal_gap, 100);
    assert!(profile.cycle_time_ms >= 45);

    env.shutdown().await
}

#[test]
async fn the_cps_cap_paces_fast_cycles() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;
    exc.get_working_mode().await?;

    // Cycles of ~5 ms capped to 20 per second.
    exc.set_cps(20.0);
    for _ in 0..10 {
        exc.pre_run();
        tokio::time::sleep(Duration::from_millis(5)).await;
        exc.post_run().await?;
    }
    let observed = exc.get_cps();
    assert!(
        (15.0..=22.0).contains(&observed),
        "expected the observed rate near 20 cps, got {observed:.1}"
    );

    env.shutdown().await
}

#[test]
async fn an_explicit_goal_gap_is_bounded_and_forwarded() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;
    exc.get_working_mode().await?;

    // Out-of-range assertions are clamped before forwarding.
    exc.set_explicit_goal_gap(250);
    let key = exc_key(100, 0);
    let mut profile = None;
    for _ in 0..40 {
        exc.pre_run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        exc.post_run().await?;
        let descriptor = env.services().applications.get(key)?;
        let current = descriptor.runtime().profile;
        if current.valid {
            profile = Some(current);
            break;
        }
    }
    let profile = profile.expect("no profile notification arrived");
    assert_eq!(profile.goal_gap, 100);

    env.shutdown().await
}
