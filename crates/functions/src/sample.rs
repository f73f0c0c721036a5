//! Sampling operator: `sampleQuality`
//!
//! `rate = 0` passes everything, `rate = -1` keeps a random 1-in-30, any
//! other positive rate keeps every `rate`-th reading.

use rand::Rng;
use tracing::warn;

use crate::params::Parameters;
use crate::state::SampleState;
use crate::value::FnValue;

/// Denominator for the `rate = -1` random sampling mode
const RANDOM_SAMPLE_DENOMINATOR: u32 = 30;

pub(crate) fn apply(params: Parameters<'_>, state: &mut SampleState, value: FnValue) -> bool {
    let rate = params.i64("rate").unwrap_or(0);
    state.value = Some(value);
    state.calls += 1;

    match rate {
        0 => true,
        -1 => rand::thread_rng().gen_range(0..RANDOM_SAMPLE_DENOMINATOR) == 0,
        r if r > 0 => state.calls % (r as u64) == 0,
        r => {
            warn!("sampleQuality rate {} is not meaningful; passing value", r);
            true
        }
    }
}

pub(crate) fn get(state: &mut SampleState) -> Option<FnValue> {
    state.value.clone()
}
