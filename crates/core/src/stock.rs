/// One quantity transition, from which the audit delta is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockTransition {
    pub previous: i64,
    pub new: i64,
}

impl StockTransition {
    /// Transition recorded when a product is first created.
    pub fn initial(quantity: i64) -> Self {
        Self {
            previous: 0,
            new: quantity,
        }
    }

    /// Signed delta persisted as `quantity_change`.
    pub fn change(self) -> i64 {
        self.new - self.previous
    }

    /// A transition where the quantity did not move still produces an audit
    /// row; callers can use this to label the zero-delta case.
    pub fn is_noop(self) -> bool {
        self.previous == self.new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_transition_starts_from_zero() {
        let transition = StockTransition::initial(10);
        assert_eq!(transition.previous, 0);
        assert_eq!(transition.change(), 10);
        assert!(!transition.is_noop());
    }

    #[test]
    fn change_is_signed() {
        assert_eq!(StockTransition { previous: 10, new: 7 }.change(), -3);
        assert_eq!(StockTransition { previous: 3, new: 9 }.change(), 6);
    }

    #[test]
    fn equal_quantities_are_a_noop() {
        let transition = StockTransition { previous: 4, new: 4 };
        assert_eq!(transition.change(), 0);
        assert!(transition.is_noop());
    }
}
