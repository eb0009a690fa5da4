// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Commit ordering, gate serialization, interrupts and the async-update path.

#![allow(missing_docs, clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{
    bring_up, commit, device, events_of, light_up, position, scan_out, scan_out_fenced, shut_down,
};
use hvs_atomic::hw::{ClockRequestId, PlaneUpdate};
use hvs_atomic::{
    FramebufferId, HvsChannel, HwEvent, Interrupt, InvalidConfig, KmsConfig, KmsError, MuxField,
    MuxWrite, OutputId, PlaneId,
};

fn update(plane: u32, output: Option<u32>, fb: Option<u64>) -> PlaneUpdate {
    PlaneUpdate {
        plane: PlaneId(plane),
        output: output.map(OutputId),
        fb: fb.map(FramebufferId),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn modeset_runs_the_hardware_steps_in_order() {
    let device = device(KmsConfig::bcm2835());
    let mut tx = device.begin();
    let id = tx.tx().value();
    light_up(&mut tx, 1);
    scan_out(&mut tx, 0, 1, 7);
    commit(&device, tx).await.expect("commit");

    let new_planes = vec![update(0, Some(1), Some(7))];
    let old_planes = vec![update(0, None, None)];
    assert_eq!(
        events_of(&device),
        vec![
            HwEvent::PreparePlanes {
                tx: id,
                planes: new_planes.clone()
            },
            HwEvent::MaskUnderrun {
                channel: HvsChannel::new(2).unwrap()
            },
            HwEvent::WriteMux(MuxWrite {
                field: MuxField::Dsp3,
                value: 2
            }),
            HwEvent::CommitPlanes {
                tx: id,
                planes: new_planes
            },
            HwEvent::EnableOutput {
                output: OutputId(1),
                channel: HvsChannel::new(2)
            },
            HwEvent::HwDone { tx: id },
            HwEvent::FlipDone { tx: id },
            HwEvent::CleanupPlanes {
                tx: id,
                planes: old_planes
            },
            HwEvent::CleanupDone { tx: id },
        ]
    );
}

#[tokio::test]
async fn disables_precede_enables_and_txp_fakes_vblank() {
    let device = device(KmsConfig::bcm2835());
    let mut tx = device.begin();
    light_up(&mut tx, 1);
    commit(&device, tx).await.expect("pv1 on channel 2");
    device.backend().take_events();

    let mut tx = device.begin();
    shut_down(&mut tx, 1);
    light_up(&mut tx, 3);
    commit(&device, tx).await.expect("hand channel 2 to the transposer");
    let events = events_of(&device);
    let disable = position(&events, &HwEvent::DisableOutput { output: OutputId(1) });
    let mux = position(
        &events,
        &HwEvent::WriteMux(MuxWrite {
            field: MuxField::Dsp3,
            value: 3,
        }),
    );
    let enable = position(
        &events,
        &HwEvent::EnableOutput {
            output: OutputId(3),
            channel: HvsChannel::new(2),
        },
    );
    let vblank = position(&events, &HwEvent::FakeVblank { output: OutputId(3) });
    assert!(disable < mux && mux < enable && enable < vblank);
}

#[tokio::test]
async fn vc5_mux_follows_hvs_output() {
    let device = device(KmsConfig::bcm2711());
    let mut tx = device.begin();
    // pixelvalve-4 drives HVS output 5 and reaches every channel.
    light_up(&mut tx, 4);
    commit(&device, tx).await.expect("enable");
    let writes: Vec<_> = events_of(&device)
        .into_iter()
        .filter(|e| matches!(e, HwEvent::WriteMux(_)))
        .collect();
    assert_eq!(
        writes,
        vec![HwEvent::WriteMux(MuxWrite {
            field: MuxField::Dsp5,
            value: 0
        })]
    );
    device.backend().take_events();

    let mut tx = device.begin();
    shut_down(&mut tx, 4);
    commit(&device, tx).await.expect("disable");
    assert!(events_of(&device).contains(&HwEvent::WriteMux(MuxWrite {
        field: MuxField::Dsp5,
        value: 3
    })));
}

#[tokio::test]
async fn vc5_boosts_then_settles_the_core_clock() {
    let device = device(KmsConfig::bcm2711());
    let mut tx = device.begin();
    light_up(&mut tx, 0);
    tx.output_state(OutputId(0)).unwrap().hvs_load = 100_000_000;
    commit(&device, tx).await.expect("raise");

    let mut tx = device.begin();
    shut_down(&mut tx, 0);
    commit(&device, tx).await.expect("lower");

    let clock: Vec<_> = events_of(&device)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                HwEvent::RequestCoreClock { .. }
                    | HwEvent::ReleaseCoreClock { .. }
                    | HwEvent::HwDone { .. }
            )
        })
        .collect();
    assert_eq!(
        clock,
        vec![
            HwEvent::RequestCoreClock {
                id: ClockRequestId(1),
                rate_hz: 500_000_000
            },
            HwEvent::HwDone { tx: 1 },
            HwEvent::RequestCoreClock {
                id: ClockRequestId(2),
                rate_hz: 100_000_000
            },
            HwEvent::ReleaseCoreClock {
                id: ClockRequestId(1)
            },
            HwEvent::HwDone { tx: 2 },
            HwEvent::RequestCoreClock {
                id: ClockRequestId(3),
                rate_hz: 0
            },
            HwEvent::ReleaseCoreClock {
                id: ClockRequestId(2)
            },
        ]
    );
}

#[tokio::test]
async fn vc4_never_touches_the_core_clock() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;
    assert!(!events_of(&device)
        .iter()
        .any(|e| matches!(e, HwEvent::RequestCoreClock { .. })));
}

#[tokio::test]
async fn gate_serializes_hardware_application() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;

    let mut first = device.begin();
    let first_id = first.tx().value();
    let signaler = scan_out_fenced(&mut first, 0, 0, 2);
    let handle = device
        .atomic_commit(first, true, &Interrupt::never())
        .await
        .expect("non-blocking commit returns after publish");
    assert_eq!(
        device.current_plane_state(PlaneId(0)).unwrap().fb,
        Some(FramebufferId(2))
    );

    let mut second = device.begin();
    let second_id = second.tx().value();
    scan_out(&mut second, 1, 0, 3);
    let blocked = tokio::spawn({
        let device = device.clone();
        async move { commit(&device, second).await }
    });

    settle().await;
    assert!(!handle.is_finished());
    assert!(!blocked.is_finished());
    assert!(!events_of(&device).contains(&HwEvent::HwDone { tx: first_id }));

    signaler.signal();
    handle.wait().await.expect("first completes");
    blocked.await.expect("join").expect("second commits");

    let events = events_of(&device);
    let first_done = position(&events, &HwEvent::CleanupDone { tx: first_id });
    let second_start = events
        .iter()
        .position(|e| e.tx() == Some(second_id))
        .expect("second recorded");
    assert!(first_done < second_start);
}

#[tokio::test]
async fn interrupted_gate_wait_changes_nothing() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;

    let mut first = device.begin();
    let signaler = scan_out_fenced(&mut first, 0, 0, 2);
    let handle = device
        .atomic_commit(first, true, &Interrupt::never())
        .await
        .expect("holds the gate");

    let mut second = device.begin();
    scan_out(&mut second, 1, 0, 3);
    let (interrupt_handle, interrupt) = Interrupt::new();
    let waiting = tokio::spawn({
        let device = device.clone();
        async move { device.atomic_commit(second, false, &interrupt).await.map(|h| h.tx()) }
    });
    settle().await;
    interrupt_handle.interrupt();
    let err = waiting.await.expect("join").expect_err("interrupted");
    assert!(matches!(err, KmsError::Interrupted));
    assert_eq!(device.current_plane_state(PlaneId(1)).unwrap().fb, None);

    signaler.signal();
    handle.wait().await.expect("first completes");
}

#[tokio::test]
async fn interrupted_fence_wait_cleans_up_prepared_planes() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;
    device.backend().take_events();

    let mut tx = device.begin();
    let id = tx.tx().value();
    let _signaler = scan_out_fenced(&mut tx, 0, 0, 2);
    let (interrupt_handle, interrupt) = Interrupt::new();
    let waiting = tokio::spawn({
        let device = device.clone();
        async move { device.atomic_commit(tx, false, &interrupt).await.map(|h| h.tx()) }
    });
    settle().await;
    interrupt_handle.interrupt();
    let err = waiting.await.expect("join").expect_err("interrupted");
    assert!(matches!(err, KmsError::Interrupted));

    let prepared = vec![update(0, Some(0), Some(2))];
    assert_eq!(
        events_of(&device),
        vec![
            HwEvent::PreparePlanes {
                tx: id,
                planes: prepared.clone()
            },
            HwEvent::CleanupPlanes {
                tx: id,
                planes: prepared
            },
        ]
    );
    assert_eq!(
        device.current_plane_state(PlaneId(0)).unwrap().fb,
        Some(FramebufferId(1))
    );

    // The gate was released.
    let mut tx = device.begin();
    scan_out(&mut tx, 0, 0, 3);
    commit(&device, tx).await.expect("gate free");
}

#[tokio::test]
async fn stale_transaction_is_refused_then_retried() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;

    let mut winner = device.begin();
    let mut loser = device.begin();
    scan_out(&mut winner, 0, 0, 5);
    scan_out(&mut loser, 0, 0, 6);
    device.atomic_check(&mut winner).expect("check winner");
    device.atomic_check(&mut loser).expect("check loser");

    commit(&device, winner).await.expect("winner commits");
    let err = commit(&device, loser).await.expect_err("stale");
    assert!(matches!(err, KmsError::StaleState));
    assert_eq!(err.kind(), hvs_atomic::ErrorKind::Retry);
    assert_eq!(
        device.current_plane_state(PlaneId(0)).unwrap().fb,
        Some(FramebufferId(5))
    );

    let mut retry = device.begin();
    scan_out(&mut retry, 0, 0, 6);
    commit(&device, retry).await.expect("rebuilt transaction commits");
    assert_eq!(
        device.current_plane_state(PlaneId(0)).unwrap().fb,
        Some(FramebufferId(6))
    );
}

#[tokio::test]
async fn concurrently_checked_disjoint_transactions_both_commit() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;

    let mut first = device.begin();
    let mut second = device.begin();
    scan_out(&mut first, 1, 0, 10);
    scan_out(&mut second, 2, 0, 20);
    first.plane_state(PlaneId(1)).unwrap().membus_load = 100;
    second.plane_state(PlaneId(2)).unwrap().membus_load = 200;
    device.atomic_check(&mut first).expect("check first");
    device.atomic_check(&mut second).expect("check second");

    commit(&device, first).await.expect("first commits");
    commit(&device, second).await.expect("second rebases and commits");

    assert_eq!(
        device.current_plane_state(PlaneId(1)).unwrap().fb,
        Some(FramebufferId(10))
    );
    assert_eq!(
        device.current_plane_state(PlaneId(2)).unwrap().fb,
        Some(FramebufferId(20))
    );
    assert_eq!(device.current_load_tracker_state().membus_load, 300);
}

#[tokio::test]
async fn concurrent_checks_serialize_at_the_gate() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;

    let mut first = device.begin();
    let first_id = first.tx().value();
    let signaler = scan_out_fenced(&mut first, 1, 0, 10);
    let mut second = device.begin();
    let second_id = second.tx().value();
    light_up(&mut second, 2);
    device.atomic_check(&mut first).expect("check first");
    device.atomic_check(&mut second).expect("check second");

    let handle = device
        .atomic_commit(first, true, &Interrupt::never())
        .await
        .expect("first publishes");
    let blocked = tokio::spawn({
        let device = device.clone();
        async move { commit(&device, second).await }
    });
    settle().await;
    assert!(!blocked.is_finished());

    signaler.signal();
    handle.wait().await.expect("first completes");
    blocked.await.expect("join").expect("second commits after the first");

    let events = events_of(&device);
    let first_done = position(&events, &HwEvent::CleanupDone { tx: first_id });
    let second_enable = position(
        &events,
        &HwEvent::EnableOutput {
            output: OutputId(2),
            channel: HvsChannel::new(1),
        },
    );
    assert!(first_done < second_enable);
    assert!(events.contains(&HwEvent::CleanupDone { tx: second_id }));
    assert_eq!(device.current_hvs_state().num_outputs, 2);
}

#[tokio::test]
async fn rebase_still_rejects_real_conflicts() {
    let device = device(KmsConfig::bcm2835());

    // pixelvalve-1 and the transposer both need channel 2.
    let mut first = device.begin();
    let mut second = device.begin();
    light_up(&mut first, 1);
    light_up(&mut second, 3);
    device.atomic_check(&mut first).expect("check first");
    device.atomic_check(&mut second).expect("check second");

    commit(&device, first).await.expect("first takes channel 2");
    device.backend().take_events();
    let err = commit(&device, second).await.expect_err("channel gone");
    assert!(matches!(
        err,
        KmsError::InvalidConfiguration(InvalidConfig::NoChannelAvailable {
            output: OutputId(3)
        })
    ));
    assert!(events_of(&device).is_empty());
    assert_eq!(
        device.current_output_state(OutputId(3)).unwrap().assigned_channel(),
        None
    );
}

#[tokio::test]
async fn prepare_failure_releases_the_gate() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;
    device.backend().fail_next_prepare("out of CMA");

    let mut tx = device.begin();
    scan_out(&mut tx, 0, 0, 2);
    let err = commit(&device, tx).await.expect_err("prepare fails");
    assert!(matches!(err, KmsError::PrepareFailed(_)));
    assert_eq!(
        device.current_plane_state(PlaneId(0)).unwrap().fb,
        Some(FramebufferId(1))
    );

    let mut tx = device.begin();
    scan_out(&mut tx, 0, 0, 2);
    commit(&device, tx).await.expect("retry succeeds");
}

#[tokio::test]
async fn async_update_skips_the_modeset_sequence() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;
    device.backend().take_events();

    let mut tx = device.begin();
    let id = tx.tx().value();
    scan_out(&mut tx, 0, 0, 2);
    tx.set_async_update(true);
    device.atomic_check(&mut tx).expect("check");
    assert!(tx.async_update());
    commit(&device, tx).await.expect("fast path");

    assert_eq!(
        events_of(&device),
        vec![
            HwEvent::PreparePlanes {
                tx: id,
                planes: vec![update(0, Some(0), Some(2))]
            },
            HwEvent::AsyncCommitPlanes {
                tx: id,
                planes: vec![update(0, Some(0), Some(2))]
            },
            HwEvent::CleanupPlanes {
                tx: id,
                planes: vec![update(0, Some(0), Some(1))]
            },
        ]
    );
    assert_eq!(
        device.current_plane_state(PlaneId(0)).unwrap().fb,
        Some(FramebufferId(2))
    );
}

#[tokio::test]
async fn async_update_with_a_modeset_falls_back() {
    let device = device(KmsConfig::bcm2835());
    bring_up(&device, 0, 1).await;
    device.backend().take_events();

    let mut tx = device.begin();
    let id = tx.tx().value();
    scan_out(&mut tx, 0, 0, 2);
    light_up(&mut tx, 2);
    tx.set_async_update(true);
    device.atomic_check(&mut tx).expect("check");
    assert!(!tx.async_update());
    commit(&device, tx).await.expect("full path");
    assert!(events_of(&device).contains(&HwEvent::HwDone { tx: id }));
}

#[tokio::test]
async fn teardown_waits_for_in_flight_commits() {
    let device = device(KmsConfig::bcm2711());
    bring_up(&device, 0, 1).await;

    let mut tx = device.begin();
    let signaler = scan_out_fenced(&mut tx, 0, 0, 2);
    let handle = device
        .atomic_commit(tx, true, &Interrupt::never())
        .await
        .expect("in flight");
    assert!(matches!(device.teardown(), Err(KmsError::DeviceBusy)));

    signaler.signal();
    handle.wait().await.expect("completes");
    device.teardown().expect("idle device tears down");
    assert!(matches!(
        events_of(&device).last(),
        Some(HwEvent::ReleaseCoreClock { .. })
    ));

    let mut tx = device.begin();
    scan_out(&mut tx, 0, 0, 3);
    let err = commit(&device, tx).await.expect_err("torn down");
    assert!(matches!(err, KmsError::DeviceClosed));
    assert_eq!(err.kind(), hvs_atomic::ErrorKind::Closed);
}

#[tokio::test]
async fn commit_runs_the_check_when_skipped() {
    let device = device(KmsConfig::bcm2835());
    let mut tx = device.begin();
    tx.output_state(OutputId(0)).unwrap().active = true;
    let err = commit(&device, tx).await.expect_err("active without enable");
    assert_eq!(err.kind(), hvs_atomic::ErrorKind::InvalidConfiguration);
    assert!(events_of(&device).is_empty());
}
