// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON scenario format and its replay against a recording device.

use anyhow::{Context, Result};
use hvs_atomic::{
    AtomicState, ColorMatrix, Device, DisplayMode, FramebufferId, HwEvent, Interrupt, KmsConfig,
    KmsError, OutputId, PlaneId, RecordingBackend,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A device configuration plus the transactions to replay on it.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Overrides the preset chosen on the command line.
    #[serde(default)]
    pub config: Option<KmsConfig>,
    /// Transactions, committed in order.
    pub transactions: Vec<ScenarioTx>,
}

/// One transaction of a scenario.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioTx {
    /// Flip the load-tracker switch before this transaction.
    pub load_tracker: Option<bool>,
    /// Commit without waiting for the hardware sequence.
    pub nonblock: bool,
    /// Request the async-update fast path.
    pub async_update: bool,
    /// Output edits.
    pub outputs: Vec<OutputEdit>,
    /// Plane edits.
    pub planes: Vec<PlaneEdit>,
}

/// Edits applied to one output; absent fields keep the published value.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputEdit {
    /// Output index.
    pub id: u32,
    /// Holds an HVS channel.
    pub enable: Option<bool>,
    /// Scanning out.
    pub active: Option<bool>,
    /// Display timing.
    pub mode: Option<DisplayMode>,
    /// Row-major colour matrix; an empty list removes it.
    pub ctm: Option<Vec<f32>>,
    /// FIFO load contributed by this output.
    pub hvs_load: Option<u64>,
}

/// Edits applied to one plane; absent fields keep the published value.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaneEdit {
    /// Plane index.
    pub id: u32,
    /// Output to attach to.
    pub output: Option<u32>,
    /// Framebuffer to scan out.
    pub fb: Option<u64>,
    /// Detach the plane (clears output and framebuffer).
    #[serde(default)]
    pub detach: bool,
    pub src_width: Option<u32>,
    pub src_height: Option<u32>,
    /// Memory-bus bandwidth.
    pub membus_load: Option<u64>,
    /// HVS cycles.
    pub hvs_load: Option<u64>,
}

/// Outcome of one replayed transaction.
#[derive(Debug, Serialize)]
pub struct Step {
    /// Transaction id.
    pub tx: u64,
    /// Whether the commit went through.
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub events: Vec<HwEvent>,
}

fn matrix(values: &[f32]) -> Result<Option<ColorMatrix>> {
    if values.is_empty() {
        return Ok(None);
    }
    let coefficients: [f32; 9] = values
        .try_into()
        .with_context(|| format!("ctm needs 9 coefficients, got {}", values.len()))?;
    Ok(Some(ColorMatrix::from_f32(coefficients)))
}

fn apply(state: &mut AtomicState, entry: &ScenarioTx) -> Result<()> {
    state.set_async_update(entry.async_update);
    for edit in &entry.outputs {
        let output = state.output_state(OutputId(edit.id))?;
        if let Some(enable) = edit.enable {
            output.enable = enable;
        }
        if let Some(active) = edit.active {
            output.active = active;
        }
        if edit.mode.is_some() {
            output.mode = edit.mode;
        }
        if let Some(values) = &edit.ctm {
            output.ctm = matrix(values)?;
        }
        if let Some(load) = edit.hvs_load {
            output.hvs_load = load;
        }
    }
    for edit in &entry.planes {
        let plane = state.plane_state(PlaneId(edit.id))?;
        if edit.detach {
            plane.output = None;
            plane.fb = None;
        }
        if let Some(output) = edit.output {
            plane.output = Some(OutputId(output));
        }
        if let Some(fb) = edit.fb {
            plane.fb = Some(FramebufferId(fb));
        }
        plane.src_width = edit.src_width.unwrap_or(plane.src_width);
        plane.src_height = edit.src_height.unwrap_or(plane.src_height);
        plane.membus_load = edit.membus_load.unwrap_or(plane.membus_load);
        plane.hvs_load = edit.hvs_load.unwrap_or(plane.hvs_load);
    }
    Ok(())
}

async fn run_one(device: &Device<RecordingBackend>, entry: &ScenarioTx) -> Result<Step> {
    if let Some(enabled) = entry.load_tracker {
        device.set_load_tracker_enabled(enabled);
    }
    let mut state = device.begin();
    let tx = state.tx().value();
    apply(&mut state, entry)?;

    let outcome: Result<(), KmsError> = async {
        let handle = device
            .atomic_commit(state, entry.nonblock, &Interrupt::never())
            .await?;
        handle.wait().await
    }
    .await;

    let events = device.backend().take_events();
    Ok(match outcome {
        Ok(()) => {
            info!(tx, events = events.len(), "committed");
            Step {
                tx,
                ok: true,
                error: None,
                kind: None,
                events,
            }
        }
        Err(err) => {
            warn!(tx, %err, "rejected");
            Step {
                tx,
                ok: false,
                kind: Some(format!("{:?}", err.kind())),
                error: Some(err.to_string()),
                events,
            }
        }
    })
}

/// Replays `scenario` on a fresh device and returns one step per transaction.
pub async fn replay(config: KmsConfig, scenario: &Scenario) -> Result<Vec<Step>> {
    let device = Device::new(config, RecordingBackend::new())?;
    let mut steps = Vec::with_capacity(scenario.transactions.len());
    for entry in &scenario.transactions {
        steps.push(run_one(&device, entry).await?);
    }
    device.teardown()?;
    Ok(steps)
}
