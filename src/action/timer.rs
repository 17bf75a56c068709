//! Timers and Delays
//!
//! `timer` bounds the run time of its body: when the duration elapses a
//! TimerExpired condition unwinds the body and `RC` is set to 1, otherwise
//! `RC` is 0. `delay` parks the thread for a duration without holding a
//! worker.
//!
//! Durations are expressions. A number is taken as milliseconds; text may
//! carry a unit suffix: `ms`, `s`, `m`, `h`, `d`, `w` or `y`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::factory::{ActionFactory, ParseContext};
use super::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionId, ConditionKind};
use crate::execution::thread::ThreadContext;
use crate::execution::timed_events::TimerToken;
use crate::workflow::model::Node;
use crate::workflow::validator::{Arity, NodeShape, ParseError};

/// Variable set by `timer`: 0 if the body finished, 1 if it expired.
pub const RC_VAR: &str = "RC";

/// Signal raised for a duration that cannot be understood.
pub const INVALID_TIMER_VALUE: &str = "InvalidTimerValue";

/// Parses a duration such as `250`, `1.5s`, `10m` or `2d`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let amount: f64 = number.parse().ok()?;
    let millis_per_unit = match unit.trim() {
        "" | "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        "w" => 604_800_000.0,
        "y" => 31_536_000_000.0,
        _ => return None,
    };
    let millis = amount * millis_per_unit;
    if !millis.is_finite() {
        return None;
    }
    Some(Duration::from_millis(millis.round() as u64))
}

fn duration_of(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|ms| *ms >= 0.0 && ms.is_finite())
            .map(|ms| Duration::from_millis(ms.round() as u64)),
        Value::String(s) => parse_duration(s),
        _ => None,
    }
}

/// Evaluates a duration expression.
///
/// On failure the running action is popped, the error is raised and the
/// outcome to return is handed back.
fn evaluate_duration(ctx: &mut ThreadContext<'_>, meta: &ActionMeta, expr: &str) -> Result<Duration, ActionOutcome> {
    let value = ctx.eval_value(expr).map_err(|e| ctx.fail(meta, e))?;
    duration_of(&value).ok_or_else(|| {
        ctx.pop_action();
        ctx.raise_signal(
            INVALID_TIMER_VALUE,
            json!({ "duration": value }),
            &meta.location(),
        );
        ActionOutcome::Proceed
    })
}

#[derive(Debug)]
struct Armed {
    token: TimerToken,
    expired: ConditionId,
    /// Cleared on disarm; the expiry callback only fires while set.
    live: Arc<Mutex<bool>>,
}

/// Runs its body with a time limit.
#[derive(Debug)]
pub struct TimerAction {
    meta: Arc<ActionMeta>,
    duration: String,
    body: Arc<dyn Action>,
    armed: Option<Armed>,
}

impl TimerAction {
    fn disarm(&mut self, ctx: &ThreadContext<'_>) -> Option<ConditionId> {
        let armed = self.armed.take()?;
        ctx.timers().cancel(armed.token);
        *armed.live.lock() = false;
        Some(armed.expired)
    }
}

impl Action for TimerAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.armed.is_some() {
            if let Some(expired) = self.disarm(ctx) {
                ctx.remove_condition(expired);
            }
            ctx.set_var(RC_VAR, Value::from(0));
            ctx.pop_action();
            return ActionOutcome::Proceed;
        }

        let duration = match evaluate_duration(ctx, &self.meta, &self.duration) {
            Ok(duration) => duration,
            Err(outcome) => return outcome,
        };
        let condition = Condition::new(ConditionKind::TimerExpired, self.meta.location());
        let expired = condition.id();
        let live = Arc::new(Mutex::new(true));
        let thread = Arc::downgrade(ctx.thread());
        let armed = Arc::clone(&live);
        let token = ctx.timers().schedule(duration, move || {
            let Some(thread) = thread.upgrade() else {
                return;
            };
            {
                let guard = armed.lock();
                if !*guard {
                    return;
                }
                debug!("Timer expired on thread {}", thread.hierarchy());
                thread.add_condition(condition);
            }
            thread.schedule();
        });
        self.armed = Some(Armed {
            token,
            expired,
            live,
        });
        ctx.push_action(self.body.clone_action());
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        if let Some(expired) = self.disarm(ctx) {
            ctx.remove_condition(expired);
            if condition.id() == expired {
                ctx.set_var(RC_VAR, Value::from(1));
            }
        }
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(TimerAction {
            meta: Arc::clone(&self.meta),
            duration: self.duration.clone(),
            body: Arc::clone(&self.body),
            armed: None,
        })
    }

    fn info(&self) -> String {
        format!("timer {}", self.duration)
    }
}

/// Parks the thread for a duration.
#[derive(Debug)]
pub struct DelayAction {
    meta: Arc<ActionMeta>,
    duration: String,
    armed: Option<(TimerToken, Arc<AtomicBool>)>,
}

impl Action for DelayAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if let Some((_, fired)) = &self.armed {
            if fired.load(Ordering::Acquire) {
                self.armed = None;
                ctx.pop_action();
                return ActionOutcome::Proceed;
            }
            return ActionOutcome::Suspend;
        }

        let duration = match evaluate_duration(ctx, &self.meta, &self.duration) {
            Ok(duration) => duration,
            Err(outcome) => return outcome,
        };
        let fired = Arc::new(AtomicBool::new(false));
        let waker = ctx.waker();
        let flag = Arc::clone(&fired);
        let token = ctx.timers().schedule(duration, move || {
            flag.store(true, Ordering::Release);
            waker.wake();
        });
        self.armed = Some((token, fired));
        ActionOutcome::Suspend
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, _condition: &Condition) -> ActionOutcome {
        if let Some((token, _)) = self.armed.take() {
            ctx.timers().cancel(token);
        }
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(DelayAction {
            meta: Arc::clone(&self.meta),
            duration: self.duration.clone(),
            armed: None,
        })
    }

    fn info(&self) -> String {
        format!("delay {}", self.duration)
    }
}

pub struct TimerFactory;

impl TimerFactory {
    fn shape() -> NodeShape {
        NodeShape::new("timer")
            .required(&["duration"])
            .children(Arity::Exactly(1))
    }
}

impl ActionFactory for TimerFactory {
    fn element(&self) -> &str {
        "timer"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        Ok(Arc::new(TimerAction {
            meta: ctx.meta(node),
            duration: ctx.required(node, "duration")?,
            body: ctx.build(&node.children[0])?,
            armed: None,
        }))
    }
}

pub struct DelayFactory;

impl DelayFactory {
    fn shape() -> NodeShape {
        NodeShape::new("delay").required(&["duration"])
    }
}

impl ActionFactory for DelayFactory {
    fn element(&self) -> &str {
        "delay"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        Ok(Arc::new(DelayAction {
            meta: ctx.meta(node),
            duration: ctx.required(node, "duration")?,
            armed: None,
        }))
    }
}
