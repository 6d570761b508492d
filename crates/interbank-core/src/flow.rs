use crate::error::BankError;

/// Steps of one payment saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStage {
    Created,
    Debited,
    Routed,
    Settling,
    Completed,
    Compensated,
}

impl SagaStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Debited => "debited",
            Self::Routed => "routed",
            Self::Settling => "settling",
            Self::Completed => "completed",
            Self::Compensated => "compensated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated)
    }
}

/// Enforces created->debited->(routed->settling)->completed|compensated.
///
/// A local payment goes straight from debited to completed. Compensation is
/// legal only once money has left the source account.
#[derive(Debug, Clone)]
pub struct SagaStageMachine {
    trace_id: String,
    stage: SagaStage,
}

impl SagaStageMachine {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self::resume(trace_id, SagaStage::Created)
    }

    /// Re-enter a saga persisted at `stage`, e.g. during restart recovery.
    pub fn resume(trace_id: impl Into<String>, stage: SagaStage) -> Self {
        Self {
            trace_id: trace_id.into(),
            stage,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn stage(&self) -> SagaStage {
        self.stage
    }

    pub fn mark_debited(&mut self) -> Result<(), BankError> {
        self.advance(&[SagaStage::Created], SagaStage::Debited)
    }

    pub fn mark_routed(&mut self) -> Result<(), BankError> {
        self.advance(&[SagaStage::Debited], SagaStage::Routed)
    }

    pub fn mark_settling(&mut self) -> Result<(), BankError> {
        self.advance(&[SagaStage::Routed], SagaStage::Settling)
    }

    pub fn mark_completed(&mut self) -> Result<(), BankError> {
        self.advance(&[SagaStage::Debited, SagaStage::Settling], SagaStage::Completed)
    }

    pub fn mark_compensated(&mut self) -> Result<(), BankError> {
        self.advance(
            &[SagaStage::Debited, SagaStage::Routed, SagaStage::Settling],
            SagaStage::Compensated,
        )
    }

    fn advance(&mut self, expected: &[SagaStage], next: SagaStage) -> Result<(), BankError> {
        if !expected.contains(&self.stage) {
            let expected = expected
                .iter()
                .map(|stage| stage.name())
                .collect::<Vec<_>>()
                .join("|");
            return Err(BankError::stage_violation(
                &self.trace_id,
                &expected,
                self.stage.name(),
            ));
        }
        self.stage = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_runs_in_order() {
        let mut machine = SagaStageMachine::new("pay-a");
        machine.mark_debited().unwrap();
        machine.mark_routed().unwrap();
        machine.mark_settling().unwrap();
        machine.mark_completed().unwrap();
        assert!(machine.stage().is_terminal());
    }

    #[test]
    fn local_path_completes_after_debit() {
        let mut machine = SagaStageMachine::new("pay-b");
        machine.mark_debited().unwrap();
        assert!(machine.mark_completed().is_ok());
    }

    #[test]
    fn cannot_compensate_before_debit() {
        let mut machine = SagaStageMachine::new("pay-c");
        let err = machine.mark_compensated().unwrap_err();
        assert!(err
            .to_string()
            .contains("expected 'debited|routed|settling', got 'created'"));
    }

    #[test]
    fn terminal_stage_is_final() {
        let mut machine = SagaStageMachine::resume("pay-d", SagaStage::Settling);
        machine.mark_compensated().unwrap();
        assert!(machine.mark_completed().is_err());
        assert!(machine.mark_compensated().is_err());
    }
}
