/// Token id of `<|end|>` in the phi3 instruct vocabulary.
pub const DEFAULT_EOS_TOKEN_ID: u32 = 32007;

/// Predicate evaluated after every generated token.
///
/// `sequences` holds one row per beam, each row being the full token history of that beam.
pub trait StoppingCriteria {
    fn should_stop(&self, sequences: &[Vec<u32>]) -> bool;
}

/// Stops once every row of the batch ends with the end-of-turn token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EosStoppingCriteria {
    pub eos_token_id: u32,
}

impl EosStoppingCriteria {
    pub fn new(eos_token_id: u32) -> Self {
        Self { eos_token_id }
    }
}

impl Default for EosStoppingCriteria {
    fn default() -> Self {
        Self::new(DEFAULT_EOS_TOKEN_ID)
    }
}

impl StoppingCriteria for EosStoppingCriteria {
    fn should_stop(&self, sequences: &[Vec<u32>]) -> bool {
        !sequences.is_empty()
            && sequences
                .iter()
                .all(|row| row.last() == Some(&self.eos_token_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_when_every_row_ends_with_eos() {
        let stop = EosStoppingCriteria::default();
        assert!(stop.should_stop(&[vec![1, 2, 32007], vec![5, 32007]]));
        assert!(stop.should_stop(&[vec![32007]]));
    }

    #[test]
    fn continues_when_any_row_differs() {
        let stop = EosStoppingCriteria::default();
        assert!(!stop.should_stop(&[vec![1, 2, 32007], vec![5, 6]]));
        assert!(!stop.should_stop(&[vec![32007, 1]]));
    }

    #[test]
    fn empty_rows_never_stop() {
        let stop = EosStoppingCriteria::default();
        assert!(!stop.should_stop(&[]));
        assert!(!stop.should_stop(&[vec![]]));
        assert!(!stop.should_stop(&[vec![32007], vec![]]));
    }

    #[test]
    fn custom_terminal_id() {
        let stop = EosStoppingCriteria::new(2);
        assert!(stop.should_stop(&[vec![7, 2], vec![2]]));
        assert!(!stop.should_stop(&[vec![7, 32007]]));
    }
}
