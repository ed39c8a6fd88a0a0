//! 疗程校验状态机
//!
//! 未校验 → 结构集已检查 → CT已检查 → 剂量已确定，任一非终态都可转入失败。
//! 清空结构集信息后回到未校验

use rt_core::{Result, RtError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 校验状态，失败原因由疗程另行保存
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ValidationState {
    Unvalidated,
    StructureChecked,
    CtsChecked,
    DoseResolved,
    Failed,
}

impl ValidationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidationState::DoseResolved | ValidationState::Failed)
    }
}

/// 校验事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ValidationEvent {
    StructureAccepted,
    CtsAccepted,
    DoseResolved,
    Rejected,
    StructureReset,
}

/// 校验状态机
#[derive(Debug)]
pub struct ValidationStateMachine {
    transitions: HashMap<(ValidationState, ValidationEvent), ValidationState>,
}

impl ValidationStateMachine {
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert(
            (ValidationState::Unvalidated, ValidationEvent::StructureAccepted),
            ValidationState::StructureChecked,
        );
        transitions.insert(
            (ValidationState::StructureChecked, ValidationEvent::CtsAccepted),
            ValidationState::CtsChecked,
        );
        transitions.insert(
            (ValidationState::CtsChecked, ValidationEvent::DoseResolved),
            ValidationState::DoseResolved,
        );
        for state in [
            ValidationState::Unvalidated,
            ValidationState::StructureChecked,
            ValidationState::CtsChecked,
        ] {
            transitions.insert((state, ValidationEvent::Rejected), ValidationState::Failed);
        }
        for state in [
            ValidationState::StructureChecked,
            ValidationState::CtsChecked,
            ValidationState::DoseResolved,
        ] {
            transitions.insert(
                (state, ValidationEvent::StructureReset),
                ValidationState::Unvalidated,
            );
        }

        Self { transitions }
    }

    pub fn can_transition(&self, from: ValidationState, event: ValidationEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: ValidationState, event: ValidationEvent) -> Result<ValidationState> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(RtError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            }),
        }
    }
}

impl Default for ValidationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = ValidationStateMachine::new();
        let state = sm
            .transition(ValidationState::Unvalidated, ValidationEvent::StructureAccepted)
            .unwrap();
        let state = sm.transition(state, ValidationEvent::CtsAccepted).unwrap();
        let state = sm.transition(state, ValidationEvent::DoseResolved).unwrap();
        assert_eq!(state, ValidationState::DoseResolved);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_rejection_only_from_non_terminal_states() {
        let sm = ValidationStateMachine::new();
        assert!(sm.can_transition(ValidationState::CtsChecked, ValidationEvent::Rejected));
        assert!(!sm.can_transition(ValidationState::DoseResolved, ValidationEvent::Rejected));
        assert!(!sm.can_transition(ValidationState::Failed, ValidationEvent::Rejected));
    }

    #[test]
    fn test_structure_reset_returns_to_unvalidated() {
        let sm = ValidationStateMachine::new();
        let state = sm
            .transition(ValidationState::DoseResolved, ValidationEvent::StructureReset)
            .unwrap();
        assert_eq!(state, ValidationState::Unvalidated);
        assert!(!sm.can_transition(ValidationState::Failed, ValidationEvent::StructureReset));
        assert!(!sm.can_transition(ValidationState::Unvalidated, ValidationEvent::StructureReset));
    }

    #[test]
    fn test_steps_cannot_be_skipped() {
        let sm = ValidationStateMachine::new();
        let result = sm.transition(ValidationState::Unvalidated, ValidationEvent::DoseResolved);
        assert!(matches!(result, Err(RtError::InvalidStateTransition { .. })));
    }
}
