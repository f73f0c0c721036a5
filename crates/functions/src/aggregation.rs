//! Windowed aggregation operators: `mean`, `min`, `max`,
//! `standardDeviation`
//!
//! All four share the circular-bucket algorithm. With `window` and
//! `slide` in milliseconds and `span = gcd(window, slide)`, readings land
//! in the bucket `(bucket_zero + (now - window_start)/span) mod len`; a
//! `get` folds `window/span` buckets from `bucket_zero`, then advances
//! the window by one slide, vacating `slide/span` buckets.
//!
//! The bucket count is `max(window, slide)/span + 1` for `mean`/`max`
//! and `min(window, slide)/span + 1` for `min`/`standardDeviation`.
//! The asymmetry is long-observed behavior that downstream consumers
//! have calibrated against; tests pin it.

use tracing::{debug, warn};

use crate::context::FunctionContext;
use crate::params::Parameters;

/// Which aggregate a slot computes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationKind {
    Mean,
    Min,
    Max,
    StandardDeviation,
}

/// Per-bucket accumulator
///
/// `min`/`max` accumulate into `Option` so that an empty window is
/// distinguishable from any real reading (no sentinel values).
#[derive(Debug, Clone)]
pub enum Accumulator {
    Mean { sum: f64, count: u64 },
    Min(Option<f64>),
    Max(Option<f64>),
    StdDev(Vec<f64>),
}

impl Accumulator {
    fn empty(kind: AggregationKind) -> Self {
        match kind {
            AggregationKind::Mean => Self::Mean { sum: 0.0, count: 0 },
            AggregationKind::Min => Self::Min(None),
            AggregationKind::Max => Self::Max(None),
            AggregationKind::StandardDeviation => Self::StdDev(Vec::new()),
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            Self::Mean { sum, count } => {
                *sum += value;
                *count += 1;
            }
            Self::Min(current) => {
                *current = Some(current.map_or(value, |c| c.min(value)));
            }
            Self::Max(current) => {
                *current = Some(current.map_or(value, |c| c.max(value)));
            }
            Self::StdDev(values) => values.push(value),
        }
    }
}

#[derive(Debug, Clone)]
struct Buckets {
    kind: AggregationKind,
    window_ms: i64,
    slide_ms: i64,
    span_ms: i64,
    window_start_ms: i64,
    bucket_zero: usize,
    buckets: Vec<Accumulator>,
}

impl Buckets {
    fn new(kind: AggregationKind, window_ms: i64, slide_ms: i64, now_ms: i64) -> Self {
        let span_ms = gcd(window_ms, slide_ms);
        let horizon = match kind {
            AggregationKind::Mean | AggregationKind::Max => window_ms.max(slide_ms),
            AggregationKind::Min | AggregationKind::StandardDeviation => window_ms.min(slide_ms),
        };
        let len = (horizon / span_ms + 1) as usize;
        Self {
            kind,
            window_ms,
            slide_ms,
            span_ms,
            window_start_ms: now_ms,
            bucket_zero: 0,
            buckets: vec![Accumulator::empty(kind); len],
        }
    }
}

/// State for a windowed-aggregation slot; buckets are allocated lazily on
/// the first reading so the window is anchored to real traffic.
#[derive(Debug, Clone, Default)]
pub struct AggregationState {
    inner: Option<Buckets>,
}

pub(crate) fn apply(
    kind: AggregationKind,
    ctx: &FunctionContext<'_>,
    attribute: &str,
    params: Parameters<'_>,
    state: &mut AggregationState,
    value: f64,
) -> bool {
    let Some(window_ms) = params.window_ms() else {
        warn!("Aggregation on '{}' has no usable window parameter; dropping value", attribute);
        return false;
    };
    let slide_ms = params.slide_ms(window_ms);

    let needs_init = match &state.inner {
        // A window anchored in the future would index a negative bucket;
        // reinitialize instead.
        Some(buckets) => {
            if ctx.now_ms < buckets.window_start_ms {
                warn!(
                    "Aggregation window for '{}' anchored in the future; resetting",
                    attribute
                );
                true
            } else {
                false
            }
        }
        None => true,
    };
    if needs_init {
        state.inner = Some(Buckets::new(kind, window_ms, slide_ms, ctx.now_ms));
    }
    let Some(buckets) = state.inner.as_mut() else {
        return false;
    };

    let elapsed = ctx.now_ms - buckets.window_start_ms;
    let bucket_index = (elapsed / buckets.span_ms) as usize;
    let len = buckets.buckets.len();
    let slot = (buckets.bucket_zero + bucket_index) % len;
    buckets.buckets[slot].add(value);

    // Windowed operators never release a value from apply; the scheduled
    // slide (or an expired window observed by the runtime) drives get.
    false
}

pub(crate) fn get(state: &mut AggregationState) -> Option<f64> {
    let buckets = state.inner.as_mut()?;
    let len = buckets.buckets.len();
    let buckets_per_window = ((buckets.window_ms / buckets.span_ms) as usize).min(len);
    let buckets_per_slide = ((buckets.slide_ms / buckets.span_ms) as usize).min(len);

    let result = fold_window(buckets, buckets_per_window);

    for i in 0..buckets_per_slide {
        let idx = (buckets.bucket_zero + i) % len;
        buckets.buckets[idx] = Accumulator::empty(buckets.kind);
    }
    buckets.bucket_zero = (buckets.bucket_zero + buckets_per_slide) % len;
    buckets.window_start_ms += buckets.slide_ms;

    if result.is_none() {
        debug!("Aggregation window closed with no contributions");
    }
    result
}

fn fold_window(buckets: &Buckets, buckets_per_window: usize) -> Option<f64> {
    let len = buckets.buckets.len();
    match buckets.kind {
        AggregationKind::Mean => {
            let mut sum = 0.0;
            let mut count = 0u64;
            for i in 0..buckets_per_window {
                if let Accumulator::Mean { sum: s, count: c } =
                    &buckets.buckets[(buckets.bucket_zero + i) % len]
                {
                    sum += s;
                    count += c;
                }
            }
            if count == 0 {
                None
            } else {
                Some(sum / count as f64)
            }
        }
        AggregationKind::Min => {
            let mut min: Option<f64> = None;
            for i in 0..buckets_per_window {
                if let Accumulator::Min(Some(v)) = &buckets.buckets[(buckets.bucket_zero + i) % len]
                {
                    min = Some(min.map_or(*v, |m| m.min(*v)));
                }
            }
            min
        }
        AggregationKind::Max => {
            let mut max: Option<f64> = None;
            for i in 0..buckets_per_window {
                if let Accumulator::Max(Some(v)) = &buckets.buckets[(buckets.bucket_zero + i) % len]
                {
                    max = Some(max.map_or(*v, |m| m.max(*v)));
                }
            }
            max
        }
        AggregationKind::StandardDeviation => {
            let mut values = Vec::new();
            for i in 0..buckets_per_window {
                if let Accumulator::StdDev(bucket) =
                    &buckets.buckets[(buckets.bucket_zero + i) % len]
                {
                    values.extend_from_slice(bucket);
                }
            }
            if values.is_empty() {
                return None;
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            Some(variance.sqrt())
        }
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    if a == 0 {
        1
    } else {
        a
    }
}
