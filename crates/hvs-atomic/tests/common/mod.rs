// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code, clippy::expect_used)]

use hvs_atomic::{
    AtomicState, ChannelMask, Device, Fence, FenceSignaler, FramebufferId,
    HwEvent, Interrupt, KmsConfig, KmsError, OutputDesc, OutputId, PlaneId, RecordingBackend,
};

pub type TestDevice = Device<RecordingBackend>;

/// Installs a test-writer subscriber once per binary; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn device(config: KmsConfig) -> TestDevice {
    init_tracing();
    Device::new(config, RecordingBackend::new()).expect("valid config")
}

/// bcm2835 layout with the outputs replaced by `routes` (one mask per output).
pub fn routed_config(routes: &[u32]) -> KmsConfig {
    KmsConfig {
        outputs: routes
            .iter()
            .enumerate()
            .map(|(i, bits)| {
                let hvs_output = u8::try_from(i).expect("small index");
                OutputDesc::new(&format!("out{i}"), ChannelMask::from_bits(*bits), hvs_output)
            })
            .collect(),
        ..KmsConfig::bcm2835()
    }
}

/// Enables and activates `output` in `tx`.
pub fn light_up(tx: &mut AtomicState, output: u32) {
    let state = tx.output_state(OutputId(output)).expect("known output");
    state.enable = true;
    state.active = true;
}

/// Disables and deactivates `output` in `tx`.
pub fn shut_down(tx: &mut AtomicState, output: u32) {
    let state = tx.output_state(OutputId(output)).expect("known output");
    state.enable = false;
    state.active = false;
}

/// Points `plane` at `fb` on `output`.
pub fn scan_out(tx: &mut AtomicState, plane: u32, output: u32, fb: u64) {
    let state = tx.plane_state(PlaneId(plane)).expect("known plane");
    state.output = Some(OutputId(output));
    state.fb = Some(FramebufferId(fb));
}

/// Like [`scan_out`] with an unsignalled fence; returns its signaller.
pub fn scan_out_fenced(tx: &mut AtomicState, plane: u32, output: u32, fb: u64) -> FenceSignaler {
    scan_out(tx, plane, output, fb);
    let (signaler, fence) = Fence::new();
    tx.plane_state(PlaneId(plane)).expect("known plane").fence = Some(fence);
    signaler
}

/// Blocking commit that also waits on the returned handle.
pub async fn commit(device: &TestDevice, tx: AtomicState) -> Result<(), KmsError> {
    device
        .atomic_commit(tx, false, &Interrupt::never())
        .await?
        .wait()
        .await
}

/// Commits a transaction lighting up `output` with `fb` on plane 0.
pub async fn bring_up(device: &TestDevice, output: u32, fb: u64) {
    let mut tx = device.begin();
    light_up(&mut tx, output);
    scan_out(&mut tx, 0, output, fb);
    commit(device, tx).await.expect("bring-up commit");
}

pub fn events_of(device: &TestDevice) -> Vec<HwEvent> {
    device.backend().events()
}

pub fn position(events: &[HwEvent], wanted: &HwEvent) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .expect("event recorded")
}
