use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::domain::{FetchedGroup, Trace};
use crate::restrictions::PreprocessSpec;

type StepParams = serde_json::Map<String, Value>;

/// A registered transform. Mutates the group in place or explains why it
/// could not.
type StepFn = fn(&mut FetchedGroup, &StepParams) -> Result<(), String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-group record of which steps ran and how they fared. `applied` is true
/// once any step has been attempted, failed ones included.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StepReport {
    pub steps: Vec<StepOutcome>,
    pub applied: bool,
}

impl StepReport {
    /// Compact log form, e.g. `[(demean:ok)->(taper:failed)]`.
    pub fn render(&self) -> String {
        if self.steps.is_empty() {
            return String::new();
        }
        let inner = self
            .steps
            .iter()
            .map(|step| {
                let status = match step.status {
                    StepStatus::Ok => "ok",
                    StepStatus::Failed => "failed",
                };
                format!("({}:{status})", step.name)
            })
            .collect::<Vec<_>>()
            .join("->");
        format!("[{inner}]")
    }
}

/// Run the spec's steps over `group` in order. Each step's failure is
/// recorded and the pipeline moves on to the next step; a broken step
/// degrades the group, it never sinks the unit.
pub fn apply(group: &mut FetchedGroup, spec: Option<&PreprocessSpec>) -> StepReport {
    let Some(spec) = spec else {
        return StepReport::default();
    };
    let Some(station_id) = group.station_id() else {
        return StepReport::default();
    };
    if !spec.applies_to(&station_id) {
        return StepReport::default();
    }

    let mut report = StepReport::default();
    for step in &spec.steps {
        report.applied = true;
        let outcome = match transform_for(&step.name)(group, &step.params) {
            Ok(()) => StepOutcome {
                name: step.name.clone(),
                status: StepStatus::Ok,
                detail: None,
            },
            Err(detail) => {
                debug!(step = %step.name, %station_id, %detail, "preprocess step failed");
                StepOutcome {
                    name: step.name.clone(),
                    status: StepStatus::Failed,
                    detail: Some(detail),
                }
            }
        };
        report.steps.push(outcome);
    }
    report
}

/// Registry of known step names. Unknown names resolve to a sentinel
/// transform that always reports failure, so a typo degrades the group
/// instead of aborting the unit.
fn transform_for(name: &str) -> StepFn {
    match name {
        "merge" => merge,
        "demean" => demean,
        "detrend" => detrend,
        "taper" => taper,
        "normalize" => normalize,
        "decimate" => decimate,
        _ => unsupported,
    }
}

fn unsupported(_group: &mut FetchedGroup, _params: &StepParams) -> Result<(), String> {
    Err("unsupported step name".to_string())
}

/// Concatenate consecutive traces with the same seed id and sampling rate
/// into one trace per channel, in start-time order.
fn merge(group: &mut FetchedGroup, _params: &StepParams) -> Result<(), String> {
    let mut traces = std::mem::take(&mut group.traces);
    traces.sort_by_key(|trace| trace.stats.starttime);

    let mut merged: Vec<Trace> = Vec::new();
    let mut pending = traces.into_iter();
    while let Some(trace) = pending.next() {
        match merged
            .iter_mut()
            .find(|existing| existing.stats.seed_id() == trace.stats.seed_id())
        {
            Some(existing) => {
                if (existing.stats.sampling_rate - trace.stats.sampling_rate).abs() > f64::EPSILON {
                    // Put everything back so the group is left intact.
                    merged.push(trace);
                    merged.extend(pending);
                    group.traces = merged;
                    return Err("sampling rates differ within one channel".to_string());
                }
                existing.data.extend(trace.data);
                if trace.stats.endtime > existing.stats.endtime {
                    existing.stats.endtime = trace.stats.endtime;
                }
            }
            None => merged.push(trace),
        }
    }
    group.traces = merged;
    Ok(())
}

fn demean(group: &mut FetchedGroup, _params: &StepParams) -> Result<(), String> {
    for trace in &mut group.traces {
        if trace.data.is_empty() {
            continue;
        }
        let mean = trace.data.iter().sum::<f64>() / trace.data.len() as f64;
        for sample in &mut trace.data {
            *sample -= mean;
        }
    }
    Ok(())
}

/// Remove a linear trend. `type` may be `linear` (least squares, default) or
/// `simple` (straight line through the first and last samples).
fn detrend(group: &mut FetchedGroup, params: &StepParams) -> Result<(), String> {
    let kind = str_param(params, "type").unwrap_or("linear");
    for trace in &mut group.traces {
        let n = trace.data.len();
        if n < 2 {
            continue;
        }
        match kind {
            "simple" => {
                let first = trace.data[0];
                let last = trace.data[n - 1];
                let slope = (last - first) / (n - 1) as f64;
                for (i, sample) in trace.data.iter_mut().enumerate() {
                    *sample -= first + slope * i as f64;
                }
            }
            "linear" => {
                let len = n as f64;
                let x_mean = (len - 1.0) / 2.0;
                let y_mean = trace.data.iter().sum::<f64>() / len;
                let mut covariance = 0.0;
                let mut variance = 0.0;
                for (i, sample) in trace.data.iter().enumerate() {
                    let dx = i as f64 - x_mean;
                    covariance += dx * (sample - y_mean);
                    variance += dx * dx;
                }
                let slope = if variance == 0.0 {
                    0.0
                } else {
                    covariance / variance
                };
                let intercept = y_mean - slope * x_mean;
                for (i, sample) in trace.data.iter_mut().enumerate() {
                    *sample -= intercept + slope * i as f64;
                }
            }
            other => return Err(format!("unknown detrend type: {other}")),
        }
    }
    Ok(())
}

/// Cosine (Hann) taper over `max_percentage` of the trace at each end,
/// default 0.05.
fn taper(group: &mut FetchedGroup, params: &StepParams) -> Result<(), String> {
    let fraction = f64_param(params, "max_percentage").unwrap_or(0.05);
    if !(0.0..=0.5).contains(&fraction) {
        return Err(format!("max_percentage out of range: {fraction}"));
    }
    for trace in &mut group.traces {
        let n = trace.data.len();
        let taper_len = ((n as f64) * fraction).floor() as usize;
        for i in 0..taper_len {
            let weight = 0.5 * (1.0 - (std::f64::consts::PI * i as f64 / taper_len as f64).cos());
            trace.data[i] *= weight;
            trace.data[n - 1 - i] *= weight;
        }
    }
    Ok(())
}

fn normalize(group: &mut FetchedGroup, _params: &StepParams) -> Result<(), String> {
    for trace in &mut group.traces {
        let peak = trace
            .data
            .iter()
            .fold(0.0_f64, |acc, sample| acc.max(sample.abs()));
        if peak == 0.0 {
            continue;
        }
        for sample in &mut trace.data {
            *sample /= peak;
        }
    }
    Ok(())
}

/// Keep every `factor`-th sample and divide the sampling rate accordingly.
fn decimate(group: &mut FetchedGroup, params: &StepParams) -> Result<(), String> {
    let factor = u64_param(params, "factor").ok_or("decimate requires an integer factor")?;
    if factor == 0 {
        return Err("decimate factor must be at least 1".to_string());
    }
    let factor = factor as usize;
    for trace in &mut group.traces {
        trace.data = trace
            .data
            .iter()
            .step_by(factor)
            .copied()
            .collect::<Vec<_>>();
        trace.stats.sampling_rate /= factor as f64;
    }
    Ok(())
}

fn f64_param(params: &StepParams, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

fn u64_param(params: &StepParams, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn str_param<'a>(params: &'a StepParams, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}
