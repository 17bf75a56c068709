use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use actiontree::action::timer::parse_duration;
use actiontree::condition::{Condition, ConditionKind, ConditionStack, ExceptionInfo};
use actiontree::{CelEvaluator, Evaluator, Scope};

fn kind_strategy() -> impl Strategy<Value = ConditionKind> {
    prop_oneof![
        Just(ConditionKind::Break),
        Just(ConditionKind::Continue),
        any::<i32>().prop_map(|v| ConditionKind::Return(json!(v))),
        "[A-Z][a-z]{0,6}".prop_map(|name| ConditionKind::Exception(ExceptionInfo::new(
            name,
            json!(null),
            Vec::new()
        ))),
        Just(ConditionKind::Rethrow),
        Just(ConditionKind::Hold),
        Just(ConditionKind::HardHold),
        Just(ConditionKind::Terminate),
        Just(ConditionKind::TimerExpired),
    ]
}

fn stack_of(kinds: &[ConditionKind]) -> (ConditionStack, Vec<Condition>) {
    let mut stack = ConditionStack::new();
    let raised: Vec<Condition> = kinds
        .iter()
        .cloned()
        .map(|kind| Condition::new(kind, "property"))
        .collect();
    for condition in &raised {
        stack.push(condition.clone());
    }
    (stack, raised)
}

proptest! {
    /// Property: the pending condition with the highest priority is serviced first
    #[test]
    fn top_has_highest_priority(kinds in prop::collection::vec(kind_strategy(), 1..20)) {
        let (stack, _) = stack_of(&kinds);
        let highest = kinds.iter().map(ConditionKind::priority).max().unwrap();
        prop_assert_eq!(stack.top().unwrap().priority(), highest);
        if kinds.iter().any(|k| matches!(k, ConditionKind::Hold)) {
            prop_assert!(matches!(stack.top().unwrap().kind(), ConditionKind::Hold));
        }
    }

    /// Property: service order is by priority, then by raise order
    #[test]
    fn service_order_is_stable(kinds in prop::collection::vec(kind_strategy(), 0..20)) {
        let (mut stack, raised) = stack_of(&kinds);

        let mut expected = raised.clone();
        expected.sort_by_key(|c| std::cmp::Reverse(c.priority()));

        let mut serviced = Vec::new();
        while let Some(top) = stack.top().cloned() {
            stack.remove(top.id());
            serviced.push(top.id());
        }
        let expected_ids: Vec<_> = expected.iter().map(Condition::id).collect();
        prop_assert_eq!(serviced, expected_ids);
    }

    /// Property: a condition id is pending at most once
    #[test]
    fn repeated_push_is_ignored(kinds in prop::collection::vec(kind_strategy(), 1..10)) {
        let (mut stack, raised) = stack_of(&kinds);
        for condition in &raised {
            prop_assert!(!stack.push(condition.clone()));
        }
        prop_assert_eq!(stack.len(), raised.len());
    }

    /// Property: children inherit exactly the inheritable conditions, in order
    #[test]
    fn inherited_stack_keeps_order(kinds in prop::collection::vec(kind_strategy(), 0..20)) {
        let (stack, _) = stack_of(&kinds);
        let inherited: Vec<_> = stack.inheritable().iter().map(Condition::id).collect();
        let expected: Vec<_> = stack
            .iter()
            .filter(|c| c.is_inheritable())
            .map(Condition::id)
            .collect();
        prop_assert_eq!(inherited, expected);
    }

    /// Property: every dotted prefix of an exception name catches it
    #[test]
    fn dotted_prefixes_match(parts in prop::collection::vec("[A-Z][a-z]{1,5}", 1..5)) {
        let info = ExceptionInfo::new(parts.join("."), json!(null), Vec::new());
        for end in 1..=parts.len() {
            let prefix = parts[..end].join(".");
            prop_assert!(info.matches(&prefix));
        }
        prop_assert!(info.matches("..."));

        let partial = &parts[0][..parts[0].len() - 1];
        prop_assert!(!info.matches(partial));
    }

    /// Property: unit suffixes scale the amount
    #[test]
    fn durations_scale_by_unit(amount in 0u64..10_000) {
        prop_assert_eq!(parse_duration(&amount.to_string()), Some(Duration::from_millis(amount)));
        prop_assert_eq!(parse_duration(&format!("{}ms", amount)), Some(Duration::from_millis(amount)));
        prop_assert_eq!(parse_duration(&format!("{}s", amount)), Some(Duration::from_secs(amount)));
        prop_assert_eq!(parse_duration(&format!("{}m", amount)), Some(Duration::from_secs(amount * 60)));
        prop_assert_eq!(parse_duration(&format!("{}h", amount)), Some(Duration::from_secs(amount * 3600)));
    }

    /// Property: integer arithmetic agrees with Rust
    #[test]
    fn integer_arithmetic_matches(a in -10_000i64..10_000, b in -10_000i64..10_000) {
        let mut scope = Scope::new();
        scope.set("a", json!(a));
        scope.set("b", json!(b));
        let evaluator = CelEvaluator;

        prop_assert_eq!(evaluator.eval_value("a + b", &scope).unwrap(), json!(a + b));
        prop_assert_eq!(evaluator.eval_value("a - b", &scope).unwrap(), json!(a - b));
        prop_assert_eq!(evaluator.eval_value("a * b", &scope).unwrap(), json!(a * b));
        prop_assert_eq!(evaluator.eval_value("a < b", &scope).unwrap(), json!(a < b));
    }
}
