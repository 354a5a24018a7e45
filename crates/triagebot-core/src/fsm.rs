//! Generic declarative state machine. States and transitions are data;
//! per-state `during`/`on_enter`/`on_exit` hooks and per-transition
//! guards/actions are dispatched back into a `FsmContext` the owning type
//! implements.

use async_trait::async_trait;

use crate::error::FsmError;

/// Behavior the state machine dispatches into. `S` is the state enum, `T` is
/// a transition identifier (so guards/actions/hooks can match on which
/// transition or state fired without the engine needing to store closures).
#[async_trait]
pub trait FsmContext<S, T>: Send
where
    S: Copy + Eq + Send + 'static,
    T: Copy + Eq + Send + 'static,
{
    async fn during(&mut self, _state: S) {}
    async fn on_enter(&mut self, _state: S) {}
    async fn on_exit(&mut self, _state: S) {}
    async fn guard(&mut self, transition: T) -> bool;
    async fn action(&mut self, _transition: T) {}
}

#[derive(Debug, Clone, Copy)]
pub struct Transition<S, T> {
    pub id: T,
    pub source: S,
    pub dest: S,
}

#[derive(Debug)]
pub struct StateMachine<S, T> {
    states: Vec<S>,
    initial: S,
    current: S,
    transitions: Vec<Transition<S, T>>,
}

impl<S, T> StateMachine<S, T>
where
    S: Copy + Eq,
    T: Copy + Eq,
{
    pub fn new(states: Vec<S>, initial: S, transitions: Vec<Transition<S, T>>) -> Result<Self, FsmError> {
        for (i, a) in states.iter().enumerate() {
            for b in &states[i + 1..] {
                if a == b {
                    return Err(FsmError::DuplicateState);
                }
            }
        }
        if !states.contains(&initial) {
            return Err(FsmError::UnknownInitial);
        }
        for t in &transitions {
            if !states.contains(&t.source) {
                return Err(FsmError::UnknownSource);
            }
            if !states.contains(&t.dest) {
                return Err(FsmError::UnknownDest);
            }
        }
        Ok(Self { states, initial, current: initial, transitions })
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    /// Executes `during`, evaluates guards for transitions sourced at the
    /// current state in declaration order, and takes the first whose guard
    /// holds (a missing guard is unconditional). Exactly one transition per
    /// call; returns whether a transition fired.
    pub async fn step<C>(&mut self, ctx: &mut C) -> bool
    where
        C: FsmContext<S, T>,
        S: Send + 'static,
        T: Send + 'static,
    {
        ctx.during(self.current).await;

        for transition in self.transitions.clone() {
            if transition.source != self.current {
                continue;
            }
            if ctx.guard(transition.id).await {
                ctx.action(transition.id).await;
                ctx.on_exit(self.current).await;
                self.current = transition.dest;
                ctx.on_enter(self.current).await;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestState {
        A,
        B,
        C,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestTransition {
        AtoB,
        AtoC,
        BtoC,
    }

    struct CountingContext {
        allow_ab: bool,
        entered: Vec<TestState>,
        exited: Vec<TestState>,
        actions_run: Vec<TestTransition>,
    }

    #[async_trait]
    impl FsmContext<TestState, TestTransition> for CountingContext {
        async fn on_enter(&mut self, state: TestState) {
            self.entered.push(state);
        }
        async fn on_exit(&mut self, state: TestState) {
            self.exited.push(state);
        }
        async fn guard(&mut self, transition: TestTransition) -> bool {
            match transition {
                TestTransition::AtoB => self.allow_ab,
                TestTransition::AtoC => !self.allow_ab,
                TestTransition::BtoC => true,
            }
        }
        async fn action(&mut self, transition: TestTransition) {
            self.actions_run.push(transition);
        }
    }

    fn machine() -> StateMachine<TestState, TestTransition> {
        StateMachine::new(
            vec![TestState::A, TestState::B, TestState::C],
            TestState::A,
            vec![
                Transition { id: TestTransition::AtoB, source: TestState::A, dest: TestState::B },
                Transition { id: TestTransition::AtoC, source: TestState::A, dest: TestState::C },
                Transition { id: TestTransition::BtoC, source: TestState::B, dest: TestState::C },
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn takes_first_matching_guard_in_declaration_order() {
        let mut m = machine();
        let mut ctx = CountingContext { allow_ab: true, entered: vec![], exited: vec![], actions_run: vec![] };
        let fired = m.step(&mut ctx).await;
        assert!(fired);
        assert_eq!(m.current(), TestState::B);
        assert_eq!(ctx.actions_run, vec![TestTransition::AtoB]);
    }

    #[tokio::test]
    async fn falls_through_to_second_guard_when_first_fails() {
        let mut m = machine();
        let mut ctx = CountingContext { allow_ab: false, entered: vec![], exited: vec![], actions_run: vec![] };
        m.step(&mut ctx).await;
        assert_eq!(m.current(), TestState::C);
    }

    #[tokio::test]
    async fn exactly_one_transition_per_step() {
        let mut m = machine();
        let mut ctx = CountingContext { allow_ab: true, entered: vec![], exited: vec![], actions_run: vec![] };
        m.step(&mut ctx).await;
        assert_eq!(m.current(), TestState::B);
        // A second step is required to reach C; one step never skips ahead.
        m.step(&mut ctx).await;
        assert_eq!(m.current(), TestState::C);
    }

    #[test]
    fn rejects_duplicate_states() {
        let err = StateMachine::<TestState, TestTransition>::new(
            vec![TestState::A, TestState::A],
            TestState::A,
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, FsmError::DuplicateState);
    }

    #[test]
    fn rejects_unknown_initial_state() {
        let err = StateMachine::<TestState, TestTransition>::new(vec![TestState::A, TestState::B], TestState::C, vec![])
            .unwrap_err();
        assert_eq!(err, FsmError::UnknownInitial);
    }

    #[test]
    fn rejects_transition_with_unknown_source() {
        let err = StateMachine::new(
            vec![TestState::A, TestState::B],
            TestState::A,
            vec![Transition { id: TestTransition::BtoC, source: TestState::C, dest: TestState::B }],
        )
        .unwrap_err();
        assert_eq!(err, FsmError::UnknownSource);
    }
}
