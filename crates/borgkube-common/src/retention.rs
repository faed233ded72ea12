//! Tiered time-bucket retention selection.
//!
//! Pure and deterministic: given the same timestamps and policy, the same
//! subset is kept. No I/O happens here; callers list their items, ask which
//! to keep, and delete the complement themselves.
//!
//! For each non-zero tier, items are bucketed by the tier's calendar key
//! (hour boundary, day, ISO week, month) and walked newest-first; the newest
//! item per bucket is kept until the tier's count of distinct buckets is
//! reached. An item kept by any tier is kept overall.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::config::Retention;

/// Calendar key for the hourly tier.
fn hour_key(t: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}-{:02}-{:02}", t.year(), t.month(), t.day(), t.hour())
}

/// Calendar key for the daily tier.
fn day_key(t: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}-{:02}", t.year(), t.month(), t.day())
}

/// Calendar key for the weekly tier. ISO week, so the year component is the
/// ISO week-year (a January 1st can belong to the previous year's last week).
fn week_key(t: &DateTime<Utc>) -> String {
    let iw = t.iso_week();
    format!("{:04}-W{:02}", iw.year(), iw.week())
}

/// Calendar key for the monthly tier.
fn month_key(t: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", t.year(), t.month())
}

/// Select the indices (into `timestamps`) of the items to keep.
///
/// Ties within a bucket break newer-first; items with identical timestamps
/// are interchangeable, so the kept set of timestamps is permutation
/// invariant.
pub fn keep_indices(timestamps: &[DateTime<Utc>], policy: &Retention) -> BTreeSet<usize> {
    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    // Newest first; equal timestamps fall back to input order for stability.
    order.sort_by(|&a, &b| timestamps[b].cmp(&timestamps[a]).then(a.cmp(&b)));

    let tiers: [(u32, fn(&DateTime<Utc>) -> String); 4] = [
        (policy.hourly, hour_key),
        (policy.daily, day_key),
        (policy.weekly, week_key),
        (policy.monthly, month_key),
    ];

    let mut keep = BTreeSet::new();
    for (count, key_fn) in tiers {
        if count == 0 {
            continue;
        }
        let mut buckets_seen: BTreeSet<String> = BTreeSet::new();
        for &idx in &order {
            let key = key_fn(&timestamps[idx]);
            if buckets_seen.contains(&key) {
                continue;
            }
            if buckets_seen.len() as u32 >= count {
                break;
            }
            buckets_seen.insert(key);
            keep.insert(idx);
        }
    }
    keep
}

/// Split a list of (name, timestamp) items into kept and pruned names.
pub fn partition<'a>(
    items: &'a [(String, DateTime<Utc>)],
    policy: &Retention,
) -> (Vec<&'a str>, Vec<&'a str>) {
    let timestamps: Vec<DateTime<Utc>> = items.iter().map(|(_, t)| *t).collect();
    let keep = keep_indices(&timestamps, policy);
    let mut kept = Vec::new();
    let mut pruned = Vec::new();
    for (i, (name, _)) in items.iter().enumerate() {
        if keep.contains(&i) {
            kept.push(name.as_str());
        } else {
            pruned.push(name.as_str());
        }
    }
    (kept, pruned)
}
