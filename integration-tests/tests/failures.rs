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
use rheostat_common::model::PROTOCOL_VERSION_MAJOR;
use rheostat_common::protocol::{read_frame, write_frame, ResultCode, RpcBody, RpcMessage};
use rheostat_daemon::model::exc::ExcState;
use rheostat_rtlib::RtLibError;
use std::time::Duration;
use test_r::test;

#[test]
async fn a_failed_actuation_quarantines_the_context() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;
    let key = exc_key(100, 0);
    env.proxy.fail_mapping_for(key);

    let runtime = env.connect("worker", 100).await?;
    let exc = runtime.register("main", "demo").await?;
    exc.enable().await?;

    // Phase three fails for this context; the application observes a
    // failed synchronization.
    let error = exc.get_working_mode().await.unwrap_err();
    assert!(matches!(error, RtLibError::SyncFailed), "got {error:?}");

    // Retry rounds keep failing for now; poll past their transients.
    let services = env.services().clone();
    let proxy = env.proxy.clone();
    wait_until("context parked in silos", Duration::from_secs(2), || {
        let services = services.clone();
        let proxy = proxy.clone();
        async move {
            services
                .applications
                .get(key)
                .map(|descriptor| descriptor.state() == ExcState::Blocked)
                .unwrap_or(false)
                && proxy.is_quarantined(key)
                && services.accountant.active_booking(key).is_none()
        }
    })
    .await;

    // Once the actuation path heals, the pending work is retried and the
    // context leaves quarantine.
    env.proxy.heal_mapping_for(key);
    let services = env.services().clone();
    wait_until("context recovered from quarantine", Duration::from_secs(5), || {
        let services = services.clone();
        async move {
            services
                .applications
                .get(key)
                .map(|descriptor| descriptor.state() == ExcState::Running)
                .unwrap_or(false)
        }
    })
    .await;
    assert_eq!(exc.get_working_mode().await?.awm_id, 2);
    assert!(!env.proxy.is_quarantined(key));

    env.shutdown().await
}

#[test]
async fn a_version_mismatch_terminates_pairing() -> anyhow::Result<()> {
    let env = TestEnvironment::start(&[("demo", THREE_MODES_RECIPE)]).await?;

    let stream = tokio::net::UnixStream::connect(&env.socket).await?;
    let (mut reader, mut writer) = stream.into_split();
    write_frame(
        &mut writer,
        &RpcMessage {
            token: 1,
            app_pid: 999,
            exc_id: 0,
            body: RpcBody::AppPair {
                major: PROTOCOL_VERSION_MAJOR + 1,
                minor: 0,
                app_name: "ancient".to_string(),
            },
        },
    )
    .await?;

    let response = read_frame(&mut reader).await?.expect("a response frame");
    assert_eq!(
        response.body,
        RpcBody::Response {
            result: ResultCode::ProtocolMismatch
        }
    );
    // The daemon hangs up afterwards.
    assert!(read_frame(&mut reader).await?.is_none());

    env.shutdown().await
}
