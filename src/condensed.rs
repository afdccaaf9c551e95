// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Condensed tick summary
//!
//! Old raw ticks are folded into a single count plus the timestamps of the
//! earliest and latest folded pulse. The individual timestamps are gone after
//! that, so range queries that straddle the summary assume its pulses are
//! spread **uniformly** over `[start, end]` and interpolate linearly. The
//! result is an approximation. It is exact only when the query covers the
//! whole summary or misses it entirely.

use crate::error::ContractError;
use chrono::{DateTime, TimeDelta, Utc};

/// Count and time bounds of every pulse folded out of the raw log.
///
/// An empty summary is represented by the absence of this value, so
/// `ticks > 0` and `start <= end` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondensedSummary {
    /// Number of folded pulses
    pub ticks: u64,
    /// Earliest folded pulse
    pub start: DateTime<Utc>,
    /// Latest folded pulse
    pub end: DateTime<Utc>,
}

impl CondensedSummary {
    /// Pulses of this summary estimated to fall inside `[start, end]`
    pub fn ticks_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, ContractError> {
        condensed_ticks_in_range(self.start, self.end, self.ticks, start, end)
    }

    /// Fold `count` more pulses spanning `[first, last]` into the summary
    pub(crate) fn absorb(
        summary: Option<Self>,
        count: u64,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> Self {
        match summary {
            Some(existing) => Self {
                ticks: existing.ticks + count,
                start: existing.start,
                end: last.max(existing.end),
            },
            None => Self {
                ticks: count,
                start: first,
                end: last,
            },
        }
    }

    /// Drop the pulses estimated to lie before `before`.
    ///
    /// Returns the shrunken summary, or `None` once nothing is left.
    pub(crate) fn trim_before(self, before: DateTime<Utc>) -> Result<Option<Self>, ContractError> {
        if before <= self.start {
            return Ok(Some(self));
        }
        if before >= self.end {
            return Ok(None);
        }
        let removed = self.ticks_in_range(self.start, before)?;
        let ticks = self.ticks - removed;
        if ticks == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            ticks,
            start: before,
            end: self.end,
        }))
    }
}

/// Estimate how many of `condensed_count` pulses, spread uniformly over
/// `[condensed_start, condensed_end]`, fall inside `[query_start, query_end]`.
///
/// | query vs. summary                      | result                         |
/// |----------------------------------------|--------------------------------|
/// | empty summary, or no overlap           | 0                              |
/// | query covers the summary               | `condensed_count`              |
/// | query starts inside, ends at/after end | fraction `(end - q_start)/len` |
/// | query starts at/before, ends inside    | fraction `(q_end - start)/len` |
/// | query strictly inside the summary      | [`ContractError`]              |
///
/// Partial results are `floor(fraction * condensed_count)`.
pub fn condensed_ticks_in_range(
    condensed_start: DateTime<Utc>,
    condensed_end: DateTime<Utc>,
    condensed_count: u64,
    query_start: DateTime<Utc>,
    query_end: DateTime<Utc>,
) -> Result<u64, ContractError> {
    if condensed_count == 0 || query_end < condensed_start || query_start > condensed_end {
        return Ok(0);
    }

    if query_start <= condensed_start && query_end >= condensed_end {
        return Ok(condensed_count);
    }

    // Past this point condensed_start < condensed_end, the span is non-zero.
    let span = condensed_end - condensed_start;
    let covered = if query_end >= condensed_end {
        condensed_end - query_start
    } else if query_start <= condensed_start {
        query_end - condensed_start
    } else {
        return Err(ContractError::OverlapInvariant {
            start: query_start,
            end: query_end,
            condensed_start,
            condensed_end,
        });
    };

    Ok(scaled_count(covered, span, condensed_count))
}

/// `floor(covered / span * count)`, exact to the microsecond
fn scaled_count(covered: TimeDelta, span: TimeDelta, count: u64) -> u64 {
    let scaled = match (covered.num_microseconds(), span.num_microseconds()) {
        (Some(covered_us), Some(span_us)) if span_us > 0 => {
            let covered_us = covered_us.clamp(0, span_us) as u128;
            (covered_us * count as u128 / span_us as u128) as u64
        }
        // Spans of more than ~292k years only fit in milliseconds
        _ => {
            let covered_ms = covered.num_milliseconds().max(0) as u128;
            let span_ms = span.num_milliseconds().max(1) as u128;
            (covered_ms.min(span_ms) * count as u128 / span_ms) as u64
        }
    };
    scaled.min(count)
}

/// Length of a time delta in fractional seconds
pub(crate) fn seconds(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}
