use super::types::Threshold;

/// Neutral color for a meter with no threshold table.
pub const FALLBACK_COLOR: &str = "#9e9e9e";

/// Pick the threshold that governs `value`.
///
/// Thresholds are sorted ascending (stable) first. The greatest threshold at
/// or below `value` wins, later entries winning ties; values below every
/// threshold take the lowest one.
pub fn select(value: f64, thresholds: &[Threshold]) -> Option<&Threshold> {
    let mut sorted: Vec<&Threshold> = thresholds.iter().collect();
    sorted.sort_by(|a, b| a.value.total_cmp(&b.value));
    let lowest = *sorted.first()?;
    Some(
        sorted
            .iter()
            .rev()
            .find(|t| t.value <= value)
            .copied()
            .unwrap_or(lowest),
    )
}

pub fn color_for(value: f64, thresholds: &[Threshold]) -> String {
    select(value, thresholds)
        .map(|t| t.color.clone())
        .unwrap_or_else(|| FALLBACK_COLOR.to_string())
}
