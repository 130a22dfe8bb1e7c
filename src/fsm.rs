//! Generic finite-state-machine runtime
//!
//! A [`Machine`] owns a context object and a transition table mapping
//! `(state, action)` to either a fixed next state or a handler closure. The
//! table is resolved at construction; dispatch is serialized by a mutex so
//! all state changes for one machine are totally ordered, no matter which
//! asynchronous source triggered them.
//!
//! Handlers run synchronously under the dispatch lock and return the next
//! state. Instead of re-invoking dispatch (re-entrancy), a handler pushes
//! follow-up actions into a FIFO that the same dispatch call drains before
//! releasing the lock. Background work started by a handler reports back
//! through an [`ActionSender`] mailbox drained by a single forwarder task
//! that holds only a weak reference to the machine.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// State tag. States are compared by pointer-free string identity.
pub type StateTag = &'static str;

/// Action tag.
pub type ActionTag = &'static str;

/// Emitted whenever a dispatch actually changes the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: StateTag,
    pub to: StateTag,
    pub action: ActionTag,
}

/// Arguments passed to a transition handler.
pub struct HandlerArgs<'a, C, P> {
    /// Machine context, owned exclusively by the machine
    pub context: &'a mut C,
    /// Payload carried by the dispatched action
    pub payload: Option<P>,
    /// State the machine was in when the action arrived
    pub state: StateTag,
    /// FIFO of actions to run after this handler returns
    pub followups: &'a mut Followups<P>,
}

/// Actions enqueued by a handler, drained in order by the same dispatch.
#[derive(Debug)]
pub struct Followups<P> {
    queue: VecDeque<(ActionTag, Option<P>)>,
}

impl<P> Followups<P> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Enqueue a follow-up action
    pub fn push(&mut self, action: ActionTag, payload: Option<P>) {
        self.queue.push_back((action, payload));
    }
}

type HandlerFn<C, P> = Box<dyn FnMut(HandlerArgs<'_, C, P>) -> Result<StateTag> + Send>;
type ErrorHandlerFn<C> =
    Box<dyn FnMut(&mut C, StateTag, ActionTag, &EngineError) -> StateTag + Send>;

/// A transition table entry for one `(state, action)` pair.
enum Transition<C, P> {
    /// Move to a fixed next state
    To(StateTag),
    /// Run a handler that computes the next state
    Run(HandlerFn<C, P>),
}

/// Per-state table: `None` marks a terminal state.
type StateEntry<C, P> = Option<HashMap<ActionTag, Transition<C, P>>>;

struct Inner<C, P> {
    state: StateTag,
    context: C,
    table: HashMap<StateTag, StateEntry<C, P>>,
    defaults: HashMap<ActionTag, HandlerFn<C, P>>,
    on_error: Option<ErrorHandlerFn<C>>,
}

/// Builder for [`Machine`]. The transition table is frozen at `build`.
pub struct MachineBuilder<C, P> {
    initial: StateTag,
    table: HashMap<StateTag, StateEntry<C, P>>,
    defaults: HashMap<ActionTag, HandlerFn<C, P>>,
    on_error: Option<ErrorHandlerFn<C>>,
}

impl<C, P> MachineBuilder<C, P> {
    pub fn new(initial: StateTag) -> Self {
        Self {
            initial,
            table: HashMap::new(),
            defaults: HashMap::new(),
            on_error: None,
        }
    }

    /// Register a handler for `(state, action)`
    pub fn on<F>(mut self, state: StateTag, action: ActionTag, handler: F) -> Self
    where
        F: FnMut(HandlerArgs<'_, C, P>) -> Result<StateTag> + Send + 'static,
    {
        self.entry(state).insert(action, Transition::Run(Box::new(handler)));
        self
    }

    /// Register a fixed transition for `(state, action)`
    pub fn edge(mut self, state: StateTag, action: ActionTag, next: StateTag) -> Self {
        self.entry(state).insert(action, Transition::To(next));
        self
    }

    /// Mark a state terminal: every dispatch against it is a no-op
    pub fn terminal(mut self, state: StateTag) -> Self {
        self.table.insert(state, None);
        self
    }

    /// Register a state-independent default handler for an action.
    ///
    /// Consulted when the current state has no entry for the action.
    pub fn fallback<F>(mut self, action: ActionTag, handler: F) -> Self
    where
        F: FnMut(HandlerArgs<'_, C, P>) -> Result<StateTag> + Send + 'static,
    {
        self.defaults.insert(action, Box::new(handler));
        self
    }

    /// Register the default exception handler. Handler errors are routed
    /// here; the return value is the state to settle in.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut C, StateTag, ActionTag, &EngineError) -> StateTag + Send + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Finish construction, giving the machine exclusive ownership of `context`.
    pub fn build(self, context: C) -> Machine<C, P> {
        let (events, _) = broadcast::channel(64);
        Machine {
            inner: Mutex::new(Inner {
                state: self.initial,
                context,
                table: self.table,
                defaults: self.defaults,
                on_error: self.on_error,
            }),
            events,
        }
    }

    fn entry(&mut self, state: StateTag) -> &mut HashMap<ActionTag, Transition<C, P>> {
        self.table
            .entry(state)
            .or_insert_with(|| Some(HashMap::new()))
            .get_or_insert_with(HashMap::new)
    }
}

/// A finite-state machine with serialized dispatch.
pub struct Machine<C, P> {
    inner: Mutex<Inner<C, P>>,
    events: broadcast::Sender<StateChange>,
}

impl<C, P> Machine<C, P> {
    /// Current state
    pub fn state(&self) -> StateTag {
        self.inner.lock().state
    }

    /// Subscribe to state-change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Read from the context under the dispatch lock
    pub fn with_context<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.inner.lock().context)
    }

    /// Mutate the context under the dispatch lock
    pub fn with_context_mut<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.inner.lock().context)
    }

    /// Dispatch an action, returning the state the machine settled in.
    ///
    /// Exactly one dispatch runs at a time per machine. The dispatched
    /// action plus any follow-ups enqueued by its handlers are processed
    /// FIFO before the lock is released.
    ///
    /// Dispatching against a terminal state is a no-op. An action with no
    /// handler in either the table or the defaults fails with
    /// [`EngineError::InvalidAction`] and leaves the state untouched.
    pub fn dispatch(&self, action: ActionTag, payload: Option<P>) -> Result<StateTag> {
        let mut inner = self.inner.lock();
        let mut pending: VecDeque<(ActionTag, Option<P>)> = VecDeque::new();
        pending.push_back((action, payload));

        while let Some((action, payload)) = pending.pop_front() {
            let from = inner.state;
            let Inner {
                state,
                context,
                table,
                defaults,
                on_error,
            } = &mut *inner;

            let next = match table.get_mut(from) {
                // Terminal state: nothing left to do, by contract
                Some(None) => continue,
                Some(Some(actions)) => match actions.get_mut(action) {
                    Some(Transition::To(next)) => Ok(*next),
                    Some(Transition::Run(handler)) => {
                        let mut followups = Followups::new();
                        let result = handler(HandlerArgs {
                            context,
                            payload,
                            state: from,
                            followups: &mut followups,
                        });
                        pending.extend(followups.queue);
                        result
                    }
                    None => Self::run_default(defaults, context, from, action, payload, &mut pending),
                },
                None => Self::run_default(defaults, context, from, action, payload, &mut pending),
            };

            let next = match next {
                Ok(next) => next,
                Err(err) => match on_error.as_mut() {
                    Some(handler) => {
                        tracing::debug!(%err, state = from, action, "handler error routed");
                        handler(context, from, action, &err)
                    }
                    None => return Err(err),
                },
            };

            if next != from {
                *state = next;
                let _ = self.events.send(StateChange {
                    from,
                    to: next,
                    action,
                });
            }
        }

        Ok(inner.state)
    }

    fn run_default(
        defaults: &mut HashMap<ActionTag, HandlerFn<C, P>>,
        context: &mut C,
        state: StateTag,
        action: ActionTag,
        payload: Option<P>,
        pending: &mut VecDeque<(ActionTag, Option<P>)>,
    ) -> Result<StateTag> {
        match defaults.get_mut(action) {
            Some(handler) => {
                let mut followups = Followups::new();
                let result = handler(HandlerArgs {
                    context,
                    payload,
                    state,
                    followups: &mut followups,
                });
                pending.extend(followups.queue);
                result
            }
            None => Err(EngineError::InvalidAction { state, action }),
        }
    }
}

impl<C: Send + 'static, P: Send + 'static> Machine<C, P> {
    /// Attach a mailbox to this machine.
    ///
    /// Spawns a forwarder task draining the inbox into `dispatch`. The
    /// forwarder holds a weak reference only, so dropping the last owning
    /// `Arc` stops it; rejected actions are logged, never propagated.
    pub fn serve(self: &Arc<Self>, inbox: ActionInbox<P>) {
        let weak = Arc::downgrade(self);
        let mut rx = inbox.rx;
        tokio::spawn(async move {
            while let Some((action, payload)) = rx.recv().await {
                let Some(machine) = weak.upgrade() else { break };
                if let Err(err) = machine.dispatch(action, payload) {
                    tracing::debug!(action, %err, "mailbox action rejected");
                }
            }
        });
    }
}

/// Sending half of a machine mailbox. Cheap to clone; safe to use from
/// spawned tasks and timers. Sends to a dropped machine are ignored.
pub struct ActionSender<P> {
    tx: mpsc::UnboundedSender<(ActionTag, Option<P>)>,
}

impl<P> Clone for ActionSender<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> ActionSender<P> {
    /// Enqueue an action for the machine
    pub fn send(&self, action: ActionTag, payload: Option<P>) {
        let _ = self.tx.send((action, payload));
    }
}

/// Receiving half of a machine mailbox; pass to [`Machine::serve`].
pub struct ActionInbox<P> {
    rx: mpsc::UnboundedReceiver<(ActionTag, Option<P>)>,
}

/// Create a mailbox pair for a machine.
pub fn action_channel<P>() -> (ActionSender<P>, ActionInbox<P>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ActionSender { tx }, ActionInbox { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        handled: Vec<&'static str>,
    }

    fn simple_machine() -> Machine<Counter, u64> {
        MachineBuilder::new("idle")
            .on("idle", "start", |args: HandlerArgs<'_, Counter, u64>| {
                args.context.handled.push("start");
                Ok("running")
            })
            .edge("running", "finish", "done")
            .terminal("done")
            .build(Counter::default())
    }

    #[test]
    fn test_basic_transitions() {
        let m = simple_machine();
        assert_eq!(m.state(), "idle");
        assert_eq!(m.dispatch("start", None).unwrap(), "running");
        assert_eq!(m.dispatch("finish", None).unwrap(), "done");
        assert_eq!(m.with_context(|c| c.handled.clone()), vec!["start"]);
    }

    #[test]
    fn test_invalid_action_preserves_state() {
        let m = simple_machine();
        let err = m.dispatch("finish", None).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidAction {
                state: "idle",
                action: "finish"
            }
        ));
        assert_eq!(m.state(), "idle");
    }

    #[test]
    fn test_terminal_state_is_idempotent() {
        let m = simple_machine();
        m.dispatch("start", None).unwrap();
        m.dispatch("finish", None).unwrap();
        // Any action against a terminal state is a no-op, repeatedly
        for _ in 0..3 {
            assert_eq!(m.dispatch("start", None).unwrap(), "done");
            assert_eq!(m.dispatch("bogus", None).unwrap(), "done");
        }
        assert_eq!(m.state(), "done");
    }

    #[test]
    fn test_followups_drain_in_order() {
        let m: Machine<Vec<&'static str>, u64> = MachineBuilder::new("a")
            .on("a", "go", |args: HandlerArgs<'_, Vec<&'static str>, u64>| {
                args.context.push("first");
                args.followups.push("step", None);
                args.followups.push("last", None);
                Ok("b")
            })
            .on("b", "step", |args| {
                args.context.push("second");
                Ok("c")
            })
            .on("c", "last", |args| {
                args.context.push("third");
                Ok("d")
            })
            .build(Vec::new());

        assert_eq!(m.dispatch("go", None).unwrap(), "d");
        assert_eq!(m.with_context(|c| c.clone()), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_fallback_handler() {
        let m: Machine<u32, u64> = MachineBuilder::new("idle")
            .edge("idle", "start", "running")
            .fallback("tick", |args| {
                *args.context += 1;
                Ok(args.state)
            })
            .build(0);

        assert_eq!(m.dispatch("tick", None).unwrap(), "idle");
        m.dispatch("start", None).unwrap();
        assert_eq!(m.dispatch("tick", None).unwrap(), "running");
        assert_eq!(m.with_context(|c| *c), 2);
    }

    #[test]
    fn test_error_routed_to_error_handler() {
        let m: Machine<(), u64> = MachineBuilder::new("idle")
            .on("idle", "start", |_| {
                Err(EngineError::Handler("boom".into()))
            })
            .on_error(|_, _, _, _| "failed")
            .build(());

        assert_eq!(m.dispatch("start", None).unwrap(), "failed");
    }

    #[test]
    fn test_error_without_handler_propagates() {
        let m: Machine<(), u64> = MachineBuilder::new("idle")
            .on("idle", "start", |_| {
                Err(EngineError::Handler("boom".into()))
            })
            .build(());

        assert!(m.dispatch("start", None).is_err());
        assert_eq!(m.state(), "idle");
    }

    #[test]
    fn test_payload_reaches_handler() {
        let m: Machine<u64, u64> = MachineBuilder::new("idle")
            .on("idle", "add", |args| {
                *args.context += args.payload.unwrap_or(0);
                Ok("idle")
            })
            .build(0);

        m.dispatch("add", Some(40)).unwrap();
        m.dispatch("add", Some(2)).unwrap();
        assert_eq!(m.with_context(|c| *c), 42);
    }

    #[test]
    fn test_state_change_emitted_only_on_change() {
        let m: Machine<(), u64> = MachineBuilder::new("idle")
            .on("idle", "noop", |_| Ok("idle"))
            .edge("idle", "start", "running")
            .build(());
        let mut rx = m.subscribe();

        m.dispatch("noop", None).unwrap();
        m.dispatch("start", None).unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(
            change,
            StateChange {
                from: "idle",
                to: "running",
                action: "start"
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mailbox_serve() {
        let (sender, inbox) = action_channel::<u64>();
        let m = Arc::new(simple_machine());
        m.serve(inbox);

        let mut rx = m.subscribe();
        sender.send("start", None);
        sender.send("finish", None);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.to, "running");
        assert_eq!(second.to, "done");
    }

    #[tokio::test]
    async fn test_mailbox_weak_reference_stops_forwarder() {
        let (sender, inbox) = action_channel::<u64>();
        let m = Arc::new(simple_machine());
        m.serve(inbox);
        drop(m);
        // Send after drop must not panic
        sender.send("start", None);
        tokio::task::yield_now().await;
    }
}
