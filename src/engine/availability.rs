use crate::model::*;

// ── Free-window computation ──────────────────────────────────────

/// Stretches of `window` the car could still take a booking in.
///
/// `bookings` are the car's blocking intervals near the window; `insured_until`
/// is the policy expiry, if any. A car with no policy has no free time,
/// and time past expiry is never free. Reported windows share their
/// boundaries with the neighbouring bookings, which under closed overlap
/// are themselves taken.
pub fn free_windows(
    window: &Span,
    bookings: &[BookingInterval],
    insured_until: Option<Ms>,
) -> Vec<Span> {
    let Some(expiry) = insured_until else {
        return Vec::new();
    };
    let base_end = window.end.min(expiry);
    if base_end <= window.start {
        return Vec::new();
    }
    let base = [Span::new(window.start, base_end)];

    let mut busy: Vec<Span> = bookings
        .iter()
        .filter(|b| b.kind.is_blocking())
        .filter_map(|b| clamp(&b.span, window))
        .collect();
    if busy.is_empty() {
        return base.to_vec();
    }
    busy.sort_by_key(|s| s.start);
    subtract_intervals(&base, &merge_overlapping(&busy))
}

/// `span` cut down to `window`, or None when nothing of positive length is left.
fn clamp(span: &Span, window: &Span) -> Option<Span> {
    let start = span.start.max(window.start);
    let end = span.end.min(window.end);
    (start < end).then(|| Span::new(start, end))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
