//! Choice among implemented candidates.

/// Index of the cheapest cost; the earliest candidate wins ties. `None` when
/// `costs` is empty.
pub fn select(costs: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &cost) in costs.iter().enumerate() {
        let better = match best {
            None => true,
            Some((_, b)) => cost < b,
        };
        if better {
            best = Some((i, cost));
        }
    }
    best.map(|(i, _)| i)
}
