// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel-to-output mux register values.

use serde::{Deserialize, Serialize};

use crate::config::{HvsGeneration, KmsConfig};
use crate::ident::OutputId;
use crate::state::AtomicState;

/// Mux field selected by an HVS output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxField {
    /// `SCALER_DISPECTRL.DSP2_MUX`.
    Dsp2,
    /// `SCALER_DISPCTRL.DSP3_MUX`.
    Dsp3,
    /// `SCALER_DISPEOLN.DSP4_MUX`.
    Dsp4,
    /// `SCALER_DISPDITHER.DSP5_MUX`.
    Dsp5,
}

/// One mux field update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MuxWrite {
    /// Field written.
    pub field: MuxField,
    /// Value written.
    pub value: u8,
}

/// `DSP3_MUX` value routing channel 2 to the transposer.
pub const DSP3_MUX_TXP: u8 = 3;
/// `DSP3_MUX` value routing channel 2 to pixel valve 1.
pub const DSP3_MUX_PV1: u8 = 2;
/// `DSPn_MUX` value disconnecting an output.
pub const DSP_MUX_DISABLED: u8 = 3;

fn vc4_writes(config: &KmsConfig, tx: &AtomicState) -> Vec<MuxWrite> {
    tx.outputs
        .iter()
        .filter_map(|(id, entry)| {
            let new = entry.new_state();
            if !new.active || new.assigned_channel.map(|c| c.index()) != Some(2) {
                return None;
            }
            let feed_txp = config
                .outputs
                .get(id.index())
                .is_some_and(|desc| desc.feed_txp);
            Some(MuxWrite {
                field: MuxField::Dsp3,
                value: if feed_txp { DSP3_MUX_TXP } else { DSP3_MUX_PV1 },
            })
        })
        .collect()
}

fn vc5_write(hvs_output: u8, channel: Option<u8>) -> Option<MuxWrite> {
    let routed = channel.unwrap_or(DSP_MUX_DISABLED);
    let (field, value) = match hvs_output {
        2 => (MuxField::Dsp2, u8::from(channel != Some(2))),
        3 => (MuxField::Dsp3, routed),
        4 => (MuxField::Dsp4, routed),
        5 => (MuxField::Dsp5, routed),
        _ => return None,
    };
    Some(MuxWrite { field, value })
}

fn vc5_writes(config: &KmsConfig, tx: &AtomicState) -> Vec<MuxWrite> {
    tx.outputs
        .iter()
        .filter(|(_, entry)| entry.new_state().update_muxing)
        .filter_map(|(id, entry): (&OutputId, _)| {
            let desc = config.outputs.get(id.index())?;
            vc5_write(
                desc.hvs_output,
                entry.new_state().assigned_channel.map(|c| c.index()),
            )
        })
        .collect()
}

/// Mux updates the commit must program for `tx`, in output order.
///
/// On VC4 only channel 2 is switchable (between pixel valve 1 and the
/// transposer) and it is rewritten for every active output using it. On VC5
/// every output whose channel changed gets its own field rewritten.
pub(crate) fn mux_writes(config: &KmsConfig, tx: &AtomicState) -> Vec<MuxWrite> {
    if config.firmware_kms {
        return Vec::new();
    }
    match config.generation {
        HvsGeneration::Vc4 => vc4_writes(config, tx),
        HvsGeneration::Vc5 => vc5_writes(config, tx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vc5_dsp2_selects_channel_two_with_zero() {
        assert_eq!(
            vc5_write(2, Some(2)),
            Some(MuxWrite { field: MuxField::Dsp2, value: 0 })
        );
        assert_eq!(
            vc5_write(2, Some(0)),
            Some(MuxWrite { field: MuxField::Dsp2, value: 1 })
        );
        assert_eq!(
            vc5_write(2, None),
            Some(MuxWrite { field: MuxField::Dsp2, value: 1 })
        );
    }

    #[test]
    fn vc5_wide_fields_take_channel_or_disabled() {
        assert_eq!(
            vc5_write(4, Some(1)),
            Some(MuxWrite { field: MuxField::Dsp4, value: 1 })
        );
        assert_eq!(
            vc5_write(5, None),
            Some(MuxWrite { field: MuxField::Dsp5, value: DSP_MUX_DISABLED })
        );
        assert_eq!(vc5_write(0, Some(0)), None);
        assert_eq!(vc5_write(1, Some(1)), None);
    }
}
