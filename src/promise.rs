//! The deferred-value state machine. A [`Promise`] starts pending, settles
//! exactly once as fulfilled or rejected, and drains its continuation queues
//! through the [`scheduler`](crate::scheduler) so that no user callback ever
//! runs on the stack that registered it or on the stack that settled the
//! value.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::scheduler;

/// What a continuation hands back: `Ok` carries a [`Step`] for the
/// unwrapping rule, `Err` rejects the derived promise with the reason.
pub type Completion<T, E> = Result<Step<T, E>, E>;

type Callback<In, T, E> = Box<dyn FnOnce(In) -> Completion<T, E>>;

/// A fulfillment input before unwrapping. A plain value settles as-is; a
/// chained promise or a foreign [`Thenable`] defers settlement until that
/// nested value itself settles, flattening arbitrarily deep nesting into a
/// single eventual outcome.
pub enum Step<T, E> {
    /// Settle fulfilled with this value.
    Value(T),
    /// Adopt the eventual outcome of another promise.
    Chain(Promise<T, E>),
    /// Adopt the eventual outcome of any thenable-compatible value.
    Foreign(Box<dyn Thenable<T, E>>),
}

impl<T, E> From<T> for Step<T, E> {
    fn from(value: T) -> Self {
        Step::Value(value)
    }
}

impl<T, E> From<Promise<T, E>> for Step<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Step::Chain(promise)
    }
}

/// The thenable compatibility surface. Anything that can deliver a value to
/// a fulfill/reject trigger pair interoperates with the unwrapping rule, in
/// both directions: [`Promise`] implements it for foreign consumers, and a
/// foreign implementation returned from a continuation is adopted the same
/// way a native promise is.
pub trait Thenable<T, E> {
    /// Arranges for exactly one of the two triggers to be called with the
    /// eventual outcome.
    fn subscribe(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(T)>,
        on_rejected: Box<dyn FnOnce(E)>,
    );
}

/// One side of one chaining call, owned by the matching queue until the
/// promise settles.
enum Registration<In, T, E> {
    /// A user callback plus the trigger handle of the derived promise its
    /// chaining call produced.
    Handler {
        callback: Callback<In, T, E>,
        forward: Producer<T, E>,
    },
    /// No callback was supplied: forward the outcome unchanged to the
    /// derived promise's matching trigger. Carries no user code, so it may
    /// fire synchronously at settlement.
    PassThrough { next: Box<dyn FnOnce(In)> },
}

enum State<T, E> {
    Pending {
        on_fulfilled: Vec<Registration<T, T, E>>,
        on_rejected: Vec<Registration<E, T, E>>,
        wakers: Vec<Waker>,
    },
    Fulfilled(T),
    Rejected(E),
}

/// A placeholder for a result that becomes available later, exactly once,
/// either as a success value `T` or a failure reason `E`.
///
/// Cloning is cheap and shares the underlying state: every clone settles
/// together and answers `then` calls against the same outcome.
pub struct Promise<T, E> {
    inner: Rc<RefCell<State<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Promise {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// The settlement trigger handle for one [`Promise`]. Cloneable; all copies
/// share the once-only settlement gate, so only the first `resolve` or
/// `reject` across every copy has any effect.
pub struct Producer<T, E> {
    inner: Rc<RefCell<State<T, E>>>,
}

impl<T, E> Clone for Producer<T, E> {
    fn clone(&self) -> Self {
        Producer {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    /// Creates a promise and runs `setup` synchronously with its trigger
    /// handle. The `Result` return is the failure boundary: an `Err` from
    /// the routine before it settles is an immediate rejection with that
    /// reason, while an `Err` after settlement is a no-op under the
    /// once-only rule.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_promise::Promise;
    ///
    /// let promise = Promise::<i32, String>::new(|producer| {
    ///     producer.resolve(5);
    ///     Ok(())
    /// });
    /// assert_eq!(promise.try_outcome(), Some(Ok(5)));
    /// ```
    pub fn new<F>(setup: F) -> Self
    where
        F: FnOnce(Producer<T, E>) -> Result<(), E>,
    {
        let (promise, producer) = Self::pair();
        if let Err(reason) = setup(producer) {
            settle_rejected(&promise.inner, reason);
        }
        promise
    }

    /// Creates a pending promise together with its trigger handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_promise::Promise;
    ///
    /// let (promise, producer) = Promise::<String, String>::pair();
    /// assert!(promise.is_pending());
    /// producer.resolve("ready".to_string());
    /// assert_eq!(promise.try_outcome(), Some(Ok("ready".to_string())));
    /// ```
    pub fn pair() -> (Self, Producer<T, E>) {
        let promise = Self::pending();
        let producer = Producer {
            inner: Rc::clone(&promise.inner),
        };
        (promise, producer)
    }

    /// An already-fulfilled promise.
    pub fn fulfilled(value: T) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(State::Fulfilled(value))),
        }
    }

    /// An already-rejected promise.
    pub fn rejected(reason: E) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(State::Rejected(reason))),
        }
    }

    fn pending() -> Self {
        Promise {
            inner: Rc::new(RefCell::new(State::Pending {
                on_fulfilled: Vec::new(),
                on_rejected: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.borrow(), State::Pending { .. })
    }

    /// The settled outcome, or `None` while pending.
    pub fn try_outcome(&self) -> Option<Result<T, E>> {
        match &*self.inner.borrow() {
            State::Pending { .. } => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Chains a success continuation; rejections pass through unchanged to
    /// the derived promise.
    pub fn then<F>(&self, on_fulfilled: F) -> Promise<T, E>
    where
        F: FnOnce(T) -> Completion<T, E> + 'static,
    {
        self.register(Some(Box::new(on_fulfilled)), None)
    }

    /// Chains a failure continuation; fulfillments pass through unchanged.
    /// A recovering handler that returns `Ok` fulfills the derived promise.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_promise::{scheduler, Promise, Step};
    ///
    /// let recovered = Promise::<i32, String>::rejected("boom".into())
    ///     .catch(|reason| Ok(Step::Value(reason.len() as i32)));
    /// scheduler::run_until_idle().unwrap();
    /// assert_eq!(recovered.try_outcome(), Some(Ok(4)));
    /// ```
    pub fn catch<G>(&self, on_rejected: G) -> Promise<T, E>
    where
        G: FnOnce(E) -> Completion<T, E> + 'static,
    {
        self.register(None, Some(Box::new(on_rejected)))
    }

    /// Chains both continuations at once.
    pub fn then_catch<F, G>(&self, on_fulfilled: F, on_rejected: G) -> Promise<T, E>
    where
        F: FnOnce(T) -> Completion<T, E> + 'static,
        G: FnOnce(E) -> Completion<T, E> + 'static,
    {
        self.register(Some(Box::new(on_fulfilled)), Some(Box::new(on_rejected)))
    }

    /// Chains with both continuations omitted: the derived promise settles
    /// identically to this one. No user code is involved, so the forwarding
    /// may happen synchronously at settlement.
    pub fn pass_through(&self) -> Promise<T, E> {
        self.register(None, None)
    }

    /// The chaining operation every public combinator lowers onto.
    ///
    /// Pending: queue one registration per side. Settled: answer directly
    /// from the stored outcome. A missing matching handler returns a clone
    /// of this same promise handle; a present one gets a freshly scheduled
    /// execution against the outcome.
    fn register(
        &self,
        on_fulfilled: Option<Callback<T, T, E>>,
        on_rejected: Option<Callback<E, T, E>>,
    ) -> Promise<T, E> {
        let settled = match &*self.inner.borrow() {
            State::Pending { .. } => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        };
        match settled {
            Some(Ok(value)) => {
                return match on_fulfilled {
                    None => self.clone(),
                    Some(callback) => spawn_settled(callback, value),
                }
            }
            Some(Err(reason)) => {
                return match on_rejected {
                    None => self.clone(),
                    Some(callback) => spawn_settled(callback, reason),
                }
            }
            None => {}
        }

        let derived = Promise::pending();
        let mut state = self.inner.borrow_mut();
        if let State::Pending {
            on_fulfilled: success_queue,
            on_rejected: failure_queue,
            ..
        } = &mut *state
        {
            match on_fulfilled {
                Some(callback) => success_queue.push(Registration::Handler {
                    callback,
                    forward: Producer {
                        inner: Rc::clone(&derived.inner),
                    },
                }),
                None => {
                    let target = Rc::clone(&derived.inner);
                    success_queue.push(Registration::PassThrough {
                        next: Box::new(move |value| settle_fulfilled(&target, value)),
                    });
                }
            }
            match on_rejected {
                Some(callback) => failure_queue.push(Registration::Handler {
                    callback,
                    forward: Producer {
                        inner: Rc::clone(&derived.inner),
                    },
                }),
                None => {
                    let target = Rc::clone(&derived.inner);
                    failure_queue.push(Registration::PassThrough {
                        next: Box::new(move |reason| settle_rejected(&target, reason)),
                    });
                }
            }
        }
        derived
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Producer<T, E> {
    /// Settles the promise fulfilled. Only the first settlement across all
    /// clones of this handle has any effect.
    pub fn resolve(&self, value: T) {
        settle_fulfilled(&self.inner, value);
    }

    /// Resolves through the unwrapping rule: a [`Step::Chain`] or
    /// [`Step::Foreign`] defers settlement to that nested value's own
    /// outcome instead of settling now.
    pub fn resolve_step(&self, step: Step<T, E>) {
        unwrap_step(&self.inner, step);
    }

    /// Settles the promise rejected.
    pub fn reject(&self, reason: E) {
        settle_rejected(&self.inner, reason);
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Thenable<T, E> for Promise<T, E> {
    fn subscribe(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(T)>,
        on_rejected: Box<dyn FnOnce(E)>,
    ) {
        {
            let mut state = self.inner.borrow_mut();
            if let State::Pending {
                on_fulfilled: success_queue,
                on_rejected: failure_queue,
                ..
            } = &mut *state
            {
                success_queue.push(Registration::PassThrough { next: on_fulfilled });
                failure_queue.push(Registration::PassThrough { next: on_rejected });
                return;
            }
        }
        match self.try_outcome() {
            Some(Ok(value)) => scheduler::schedule(Box::new(move || on_fulfilled(value))),
            Some(Err(reason)) => scheduler::schedule(Box::new(move || on_rejected(reason))),
            None => {}
        }
    }
}

/// Awaiting a promise yields its settled outcome. A promise that is never
/// settled stays pending forever; its queued continuations and wakers are
/// simply never fired.
impl<T: Clone + 'static, E: Clone + 'static> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.borrow_mut();
        match &mut *state {
            State::Pending { wakers, .. } => {
                // Keep every waker; distinct clones of this handle may be
                // polled from distinct tasks.
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner.borrow() {
            State::Pending {
                on_fulfilled,
                on_rejected,
                ..
            } => f
                .debug_struct("Promise")
                .field("state", &"pending")
                .field("on_fulfilled", &on_fulfilled.len())
                .field("on_rejected", &on_rejected.len())
                .finish(),
            State::Fulfilled(_) => f.debug_struct("Promise").field("state", &"fulfilled").finish(),
            State::Rejected(_) => f.debug_struct("Promise").field("state", &"rejected").finish(),
        }
    }
}

impl<T, E> fmt::Debug for Producer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").finish()
    }
}

/// Registers a user callback against an already-available outcome: the
/// execution is scheduled, never run on the registering stack.
fn spawn_settled<In, T, E>(callback: Callback<In, T, E>, outcome: In) -> Promise<T, E>
where
    In: 'static,
    T: Clone + 'static,
    E: Clone + 'static,
{
    let derived = Promise::pending();
    let forward = Producer {
        inner: Rc::clone(&derived.inner),
    };
    scheduler::schedule(Box::new(move || run_handler(callback, outcome, forward)));
    derived
}

/// Runs one scheduled continuation and routes its completion into the
/// derived promise's triggers. An `Err` from the callback rejects the
/// derived promise; it never reaches the original promise or any sibling
/// registration.
fn run_handler<In, T, E>(callback: Callback<In, T, E>, input: In, forward: Producer<T, E>)
where
    In: 'static,
    T: Clone + 'static,
    E: Clone + 'static,
{
    match callback(input) {
        Ok(step) => unwrap_step(&forward.inner, step),
        Err(reason) => settle_rejected(&forward.inner, reason),
    }
}

/// The unwrapping rule, written as a loop so a chain of already-settled
/// promises unwinds iteratively instead of recursing per nesting level.
fn unwrap_step<T, E>(inner: &Rc<RefCell<State<T, E>>>, step: Step<T, E>)
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    let mut step = step;
    loop {
        match step {
            Step::Value(value) => return settle_fulfilled(inner, value),
            Step::Foreign(thenable) => {
                let fulfill_target = Rc::clone(inner);
                let reject_target = Rc::clone(inner);
                return thenable.subscribe(
                    Box::new(move |value| settle_fulfilled(&fulfill_target, value)),
                    Box::new(move |reason| settle_rejected(&reject_target, reason)),
                );
            }
            Step::Chain(promise) => {
                let outcome = {
                    let mut state = promise.inner.borrow_mut();
                    match &mut *state {
                        State::Fulfilled(value) => Some(Ok(value.clone())),
                        State::Rejected(reason) => Some(Err(reason.clone())),
                        State::Pending {
                            on_fulfilled,
                            on_rejected,
                            ..
                        } => {
                            let fulfill_target = Rc::clone(inner);
                            on_fulfilled.push(Registration::PassThrough {
                                next: Box::new(move |value| {
                                    settle_fulfilled(&fulfill_target, value)
                                }),
                            });
                            let reject_target = Rc::clone(inner);
                            on_rejected.push(Registration::PassThrough {
                                next: Box::new(move |reason| {
                                    settle_rejected(&reject_target, reason)
                                }),
                            });
                            None
                        }
                    }
                };
                match outcome {
                    Some(Ok(value)) => step = Step::Value(value),
                    Some(Err(reason)) => return settle_rejected(inner, reason),
                    None => return,
                }
            }
        }
    }
}

fn settle_fulfilled<T, E>(inner: &Rc<RefCell<State<T, E>>>, value: T)
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    // The queue is moved out and the borrow released before anything fires:
    // a continuation that re-enters registration lands on the settled fast
    // path, never on the queue being drained. The failure queue is dropped
    // with the replaced state; its registrations never fire.
    let (queue, wakers) = {
        let mut state = inner.borrow_mut();
        let previous = std::mem::replace(&mut *state, State::Fulfilled(value.clone()));
        match previous {
            State::Pending {
                on_fulfilled,
                wakers,
                ..
            } => (on_fulfilled, wakers),
            already_settled => {
                *state = already_settled;
                return;
            }
        }
    };
    for registration in queue {
        match registration {
            Registration::Handler { callback, forward } => {
                let input = value.clone();
                scheduler::schedule(Box::new(move || run_handler(callback, input, forward)));
            }
            Registration::PassThrough { next } => next(value.clone()),
        }
    }
    for waker in wakers {
        waker.wake();
    }
}

fn settle_rejected<T, E>(inner: &Rc<RefCell<State<T, E>>>, reason: E)
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    let (queue, wakers) = {
        let mut state = inner.borrow_mut();
        let previous = std::mem::replace(&mut *state, State::Rejected(reason.clone()));
        match previous {
            State::Pending {
                on_rejected,
                wakers,
                ..
            } => (on_rejected, wakers),
            already_settled => {
                *state = already_settled;
                return;
            }
        }
    };
    for registration in queue {
        match registration {
            Registration::Handler { callback, forward } => {
                let input = reason.clone();
                scheduler::schedule(Box::new(move || run_handler(callback, input, forward)));
            }
            Registration::PassThrough { next } => next(reason.clone()),
        }
    }
    for waker in wakers {
        waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::{block_on, LocalPool};
    use futures::task::LocalSpawnExt;

    struct Immediate(i32);

    impl Thenable<i32, String> for Immediate {
        fn subscribe(
            self: Box<Self>,
            on_fulfilled: Box<dyn FnOnce(i32)>,
            _on_rejected: Box<dyn FnOnce(String)>,
        ) {
            on_fulfilled(self.0);
        }
    }

    #[test]
    fn foreign_thenable_is_unwrapped() {
        let derived = Promise::<i32, String>::fulfilled(0)
            .then(|_| Ok(Step::Foreign(Box::new(Immediate(7)))));
        scheduler::run_until_idle().unwrap();
        assert_eq!(derived.try_outcome(), Some(Ok(7)));
    }

    #[test]
    fn native_promise_acts_as_thenable_for_foreign_consumers() {
        // Pending: both triggers queue as pass-throughs and only the one
        // matching the settlement fires, synchronously, no scheduling.
        let (promise, producer) = Promise::<i32, String>::pair();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let fulfilled = Rc::clone(&seen);
        let rejected = Rc::clone(&seen);
        Box::new(promise).subscribe(
            Box::new(move |value| fulfilled.borrow_mut().push(format!("ok:{value}"))),
            Box::new(move |reason| rejected.borrow_mut().push(format!("err:{reason}"))),
        );
        producer.resolve(4);
        assert_eq!(scheduler::pending(), 0);
        assert_eq!(*seen.borrow(), vec!["ok:4".to_string()]);

        // Settled: the matching trigger is scheduled, never run on the
        // subscribing stack.
        let seen = Rc::new(RefCell::new(Vec::new()));
        let fulfilled = Rc::clone(&seen);
        let rejected = Rc::clone(&seen);
        Box::new(Promise::<i32, String>::rejected("r".into())).subscribe(
            Box::new(move |value| fulfilled.borrow_mut().push(format!("ok:{value}"))),
            Box::new(move |reason| rejected.borrow_mut().push(format!("err:{reason}"))),
        );
        assert!(seen.borrow().is_empty());
        scheduler::run_until_idle().unwrap();
        assert_eq!(*seen.borrow(), vec!["err:r".to_string()]);
    }

    #[test]
    fn step_converts_from_values_and_promises() {
        let (promise, producer) = Promise::<i32, String>::pair();
        producer.resolve_step(4.into());
        assert_eq!(promise.try_outcome(), Some(Ok(4)));

        let (outer, outer_producer) = Promise::<i32, String>::pair();
        outer_producer.resolve_step(Promise::fulfilled(6).into());
        assert_eq!(outer.try_outcome(), Some(Ok(6)));
    }

    #[test]
    fn chained_step_adopts_settled_outcome_without_scheduling() {
        let (promise, producer) = Promise::<i32, String>::pair();
        producer.resolve_step(Step::Chain(Promise::fulfilled(11)));
        assert_eq!(scheduler::pending(), 0);
        assert_eq!(promise.try_outcome(), Some(Ok(11)));
    }

    #[test]
    fn resolving_with_own_chain_stays_pending() {
        let (promise, producer) = Promise::<i32, String>::pair();
        producer.resolve_step(Step::Chain(promise.clone()));
        assert!(promise.is_pending());
        // A later real settlement still wins, exactly once.
        producer.resolve(3);
        assert_eq!(promise.try_outcome(), Some(Ok(3)));
    }

    #[test]
    fn settled_promise_is_ready_future() {
        assert_eq!(block_on(Promise::<i32, String>::fulfilled(5)), Ok(5));
        assert_eq!(
            block_on(Promise::<i32, String>::rejected("e".into())),
            Err("e".to_string())
        );
    }

    #[test]
    fn settlement_wakes_waiting_task() {
        let (promise, producer) = Promise::<i32, String>::pair();
        let got = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&got);
        let mut pool = LocalPool::new();
        pool.spawner()
            .spawn_local(async move {
                *sink.borrow_mut() = Some(promise.await);
            })
            .unwrap();
        pool.run_until_stalled();
        assert_eq!(*got.borrow(), None);
        producer.resolve(9);
        pool.run_until_stalled();
        assert_eq!(*got.borrow(), Some(Ok(9)));
    }

    #[test]
    fn debug_reports_state_and_queue_depth() {
        let (promise, producer) = Promise::<i32, String>::pair();
        promise.then(|value| Ok(Step::Value(value)));
        assert_eq!(
            format!("{promise:?}"),
            "Promise { state: \"pending\", on_fulfilled: 1, on_rejected: 1 }"
        );
        producer.resolve(1);
        assert_eq!(format!("{promise:?}"), "Promise { state: \"fulfilled\" }");
        scheduler::run_until_idle().unwrap();
    }
}
