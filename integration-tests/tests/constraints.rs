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

use integration_tests::{exc_key, wait_until, TestEnvironment, THREE_MODES_RECIPE};
use rheostat_common::model::AwmId;
use rheostat_daemon::model::exc::ExcState;
use rheostat_rtlib::ConstraintKind;
use std::time::Duration;
use test_r::test;

#[test]
async fn an_upper_bound_displaces_the_running_mode() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;
    assert_eq!(exc.get_working_mode().await?.awm_id, 2);

    let key = exc_key(100, 0);
    exc.set_constraint(ConstraintKind::Upper, 1).await?;

    // Mode 2 is masked out, so the context is rescheduled among {0, 1}
    // and resumes on the best remaining mode.
    let services = env.services().clone();
    wait_until("rescheduled below the bound", Duration::from_secs(5), || {
        let services = services.clone();
        async move {
            services
                .applications
                .get(key)
                .map(|descriptor| {
                    let runtime = descriptor.runtime();
                    runtime.state() == ExcState::Running
                        && runtime.current_awm == Some(AwmId(1))
                })
                .unwrap_or(false)
        }
    })
    .await;

    let descriptor = env.services().applications.get(key)?;
    assert_eq!(descriptor.runtime().enabled_mask(), 0b011);

    // Clearing restores the full recipe mask and the context climbs
    // back.
    exc.clear_constraints().await?;
    exc.set_constraint(ConstraintKind::Lower, 0).await?;
    assert_eq!(
        env.services().applications.get(key)?.runtime().enabled_mask(),
        0b111
    );

    env.shutdown().await
}
