//! Length budgeting for a single prompt/response exchange.

/// Splits a remaining token budget between a prompt span and a response span.
///
/// Implementations must return `(s, t)` with `s <= source_len`, `t <= target_len`, and
/// `s + t <= budget`.
pub trait LengthBudget: Send + Sync {
    /// Returns the truncated `(source_len, target_len)`.
    fn split(&self, source_len: usize, target_len: usize, budget: usize) -> (usize, usize);
}

/// Default split: short spans are kept whole, otherwise the budget is shared in proportion to
/// the span lengths. The response is sized first and the prompt takes what remains.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProportionalBudget;

impl LengthBudget for ProportionalBudget {
    fn split(&self, source_len: usize, target_len: usize, budget: usize) -> (usize, usize) {
        if source_len + target_len == 0 {
            return (0, 0);
        }
        let max_target_len = if target_len * 2 < budget {
            budget
        } else if source_len * 2 < budget {
            budget - source_len
        } else {
            let total = (source_len + target_len) as u128;
            usize::try_from(budget as u128 * target_len as u128 / total).unwrap_or(budget)
        };
        let new_target_len = max_target_len.min(target_len);
        let new_source_len = budget.saturating_sub(new_target_len).min(source_len);
        (new_source_len, new_target_len)
    }
}
