//! The future / promise / dependent-header graph (design doc §4.F).
//!
//! The original models four header shapes (`result`, `promise`,
//! `dependent`, `nil`) behind one reference-counted base class, with a
//! dependent header's body dispatching on whether it resolves
//! synchronously or proxies to another future. This crate collapses that
//! to one generic `Future<T>` backed by an `Rc<RefCell<Inner<T>>>` slot:
//! "result" and "nil" are simply a slot constructed already holding a
//! value (`Future::ready`); "dependent" is a slot with a pending waiter
//! closure attached by [`Future::then`]/[`Future::then_future`]; "promise"
//! is [`Promise<T>`], which shares its future's slot directly rather than
//! proxying into it.
//!
//! Because everything here runs on one persona's thread, the slot needs no
//! atomics — `Rc`/`RefCell` match the teacher's own single-thread FIFO
//! style (`Rc<RefCell<VecDeque<_>>>` in `communication::allocator::thread`)
//! rather than the `Arc`/`Mutex` the cross-thread paths use.

use std::cell::RefCell;
use std::rc::Rc;

type Waiter<T> = Box<dyn FnOnce(T)>;

struct Inner<T> {
    value: Option<T>,
    waiters: Vec<Waiter<T>>,
}

/// A ref-counted, single-assignment future of `T`.
///
/// `T` is typically a tuple (`()`, `(i32,)`, `(i32, String)`, …) standing
/// in for the "result tuple" the specification describes; this crate does
/// not need a variadic `T...` pack because Rust tuples already serve that
/// role directly.
pub struct Future<T: 'static> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: 'static> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future { inner: self.inner.clone() }
    }
}

impl<T: Clone + 'static> Future<T> {
    /// A future that is ready immediately with `value` — the "result"
    /// header shape. `Future::<()>::ready(())` is the "nil" shape.
    pub fn ready(value: T) -> Self {
        Future { inner: Rc::new(RefCell::new(Inner { value: Some(value), waiters: Vec::new() })) }
    }

    pub(crate) fn pending() -> Self {
        Future { inner: Rc::new(RefCell::new(Inner { value: None, waiters: Vec::new() })) }
    }

    /// `true` iff this future already holds a value. Trivial readiness in
    /// the spec's sense: a `Future` built by [`Future::ready`] (or one
    /// whose antecedent already settled before `then` was called) reports
    /// `true` without any progress having run.
    pub fn is_ready(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// The held value, if ready, without blocking.
    pub fn peek(&self) -> Option<T> {
        self.inner.borrow().value.clone()
    }

    /// Fulfills this future with `value`, running every registered waiter
    /// in the order they were attached and then dropping them. Public so
    /// [`Promise`] can share a future's slot; ordinary users reach this
    /// only indirectly through `then`/`when_all`/`rpc` completions.
    pub(crate) fn fulfill(&self, value: T) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(inner.value.is_none(), "a future may only be fulfilled once");
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            waiter(value.clone());
        }
    }

    /// Attaches `f`, run with this future's value once ready, producing a
    /// fresh `Future<U>`.
    ///
    /// If this future is already ready, `f` runs immediately and the
    /// result is wrapped in an already-ready `Future<U>` — the spec's
    /// "mapped"/trivially-ready degenerate case. This implementation
    /// evaluates eagerly and caches the result rather than re-running `f`
    /// on every subsequent read, a deliberate simplification of the
    /// original's lazy-per-read `impl_mapped` (see `DESIGN.md`).
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        if let Some(value) = self.peek() {
            return Future::ready(f(value));
        }
        let out = Future::pending();
        let out_for_waiter = out.clone();
        self.inner.borrow_mut().waiters.push(Box::new(move |value| {
            out_for_waiter.fulfill(f(value));
        }));
        out
    }

    /// Attaches `f`, run with this future's value once ready, where `f`
    /// itself returns a `Future<U>` that this call's result proxies to.
    ///
    /// Matches the spec's proxy-chain compression: once the inner future
    /// (`f`'s return value) readies, its value is forwarded directly into
    /// the outer future with no further indirection kept alive.
    pub fn then_future<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        let out = Future::pending();
        let out_for_chain = out.clone();
        let chain = move |value: T| {
            let proxied = f(value);
            if let Some(inner_value) = proxied.peek() {
                out_for_chain.fulfill(inner_value);
            } else {
                let out_for_inner = out_for_chain.clone();
                proxied.inner.borrow_mut().waiters.push(Box::new(move |v| out_for_inner.fulfill(v)));
            }
        };
        if let Some(value) = self.peek() {
            chain(value);
        } else {
            self.inner.borrow_mut().waiters.push(Box::new(chain));
        }
        out
    }

    /// Spins `progress(user)` against `transport` until this future is
    /// ready, then returns its value.
    ///
    /// Per design doc §5, callers must never `wait` on a future whose
    /// completion requires LPCs on a persona they do not currently drain;
    /// this function cannot detect that misuse and will spin forever if it
    /// happens, matching the spec's "detected only by external timeout".
    pub fn wait(&self, transport: &dyn pgas_transport::Transport) -> T {
        while !self.is_ready() {
            crate::progress::progress(transport, crate::persona::ProgressLevel::User);
        }
        self.peek().expect("just observed ready")
    }
}

/// Concatenates two futures' results into one future of the pair, ready
/// once both antecedents are ready. A concrete two-way instance of the
/// spec's variadic `when_all`; `pgas`'s own call sites that need more
/// arguments nest `when_all2` calls the way `(a, (b, c))` nests tuples.
pub fn when_all2<A, B>(a: Future<A>, b: Future<B>) -> Future<(A, B)>
where
    A: Clone + 'static,
    B: Clone + 'static,
{
    let out = Future::pending();
    let state = Rc::new(RefCell::new((None::<A>, None::<B>)));

    {
        let out = out.clone();
        let state = state.clone();
        let maybe_complete = move |state: &RefCell<(Option<A>, Option<B>)>| {
            let ready = {
                let s = state.borrow();
                s.0.is_some() && s.1.is_some()
            };
            if ready {
                let (av, bv) = state.borrow_mut().clone();
                out.fulfill((av.unwrap(), bv.unwrap()));
            }
        };

        if let Some(av) = a.peek() {
            state.borrow_mut().0 = Some(av);
        } else {
            let state = state.clone();
            let maybe_complete = maybe_complete.clone();
            a.inner.borrow_mut().waiters.push(Box::new(move |v| {
                state.borrow_mut().0 = Some(v);
                maybe_complete(&state);
            }));
        }

        if let Some(bv) = b.peek() {
            state.borrow_mut().1 = Some(bv);
        } else {
            let state = state.clone();
            let maybe_complete = maybe_complete.clone();
            b.inner.borrow_mut().waiters.push(Box::new(move |v| {
                state.borrow_mut().1 = Some(v);
                maybe_complete(&state);
            }));
        }

        maybe_complete(&state);
    }

    out
}

/// A user-fulfillable future source (design doc §4.F "Promise lifecycle").
///
/// `new(n)` starts a countdown at `n + 1`: the `+1` is the implicit unit
/// [`Promise::finalize`] itself consumes. `require_anonymous`,
/// `fulfill_anonymous`, and `fulfill_result` all adjust the same counter;
/// the future shared by every [`Promise::get_future`] call becomes ready
/// the instant the counter reaches zero, which — because `finalize`'s own
/// decrement is always last — is never before `finalize` has been called.
pub struct Promise<T: Clone + 'static> {
    countdown: Rc<std::cell::Cell<i64>>,
    finalized: Rc<std::cell::Cell<bool>>,
    future: Future<T>,
    result_set: Rc<std::cell::Cell<bool>>,
    pending_result: Rc<RefCell<Option<T>>>,
}

impl<T: Clone + 'static> Promise<T> {
    /// A promise with `n` outstanding anonymous dependencies (default 1 in
    /// the original; callers here always pass it explicitly).
    pub fn new(n: i64) -> Self {
        Promise {
            countdown: Rc::new(std::cell::Cell::new(n + 1)),
            finalized: Rc::new(std::cell::Cell::new(false)),
            future: Future::pending(),
            result_set: Rc::new(std::cell::Cell::new(false)),
            pending_result: Rc::new(RefCell::new(None)),
        }
    }

    /// Adds `k` more outstanding anonymous dependencies.
    ///
    /// # Panics
    ///
    /// Panics if the countdown has already reached zero — the spec marks
    /// this a precondition violation ("legal only while countdown > 0").
    pub fn require_anonymous(&self, k: i64) {
        assert!(self.countdown.get() > 0, "require_anonymous called on an already-settled promise");
        self.countdown.set(self.countdown.get() + k);
    }

    /// Decrements the countdown by `k`, settling the future if it reaches
    /// zero.
    pub fn fulfill_anonymous(&self, k: i64) {
        self.countdown.set(self.countdown.get() - k);
        self.maybe_settle();
    }

    /// Sets the result value, decrementing the countdown by one.
    ///
    /// # Panics
    ///
    /// Panics if called a second time.
    pub fn fulfill_result(&self, value: T) {
        assert!(!self.result_set.get(), "fulfill_result called more than once");
        self.result_set.set(true);
        *self.pending_result.borrow_mut() = Some(value);
        self.countdown.set(self.countdown.get() - 1);
        self.maybe_settle();
    }

    /// Delivers the implicit final decrement and returns a future that
    /// readies once the countdown reaches zero. After this call the
    /// promise may not be `require_anonymous`d further.
    pub fn finalize(&self) -> Future<T> {
        assert!(!self.finalized.get(), "finalize called more than once");
        self.finalized.set(true);
        self.countdown.set(self.countdown.get() - 1);
        self.maybe_settle();
        self.get_future()
    }

    /// A shared-reference future observing this promise's eventual result.
    /// May be called any number of times, before or after `finalize`.
    pub fn get_future(&self) -> Future<T> {
        self.future.clone()
    }

    fn maybe_settle(&self) {
        if self.countdown.get() == 0 && !self.future.is_ready() {
            let value = self.pending_result.borrow_mut().take().expect(
                "promise countdown reached zero without fulfill_result ever being called",
            );
            self.future.fulfill(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_future_is_trivially_ready() {
        let f = Future::ready(42);
        assert!(f.is_ready());
        assert_eq!(f.peek(), Some(42));
    }

    #[test]
    fn then_on_ready_future_runs_immediately() {
        let f = Future::ready(41).then(|x| x + 1);
        assert_eq!(f.peek(), Some(42));
    }

    #[test]
    fn then_on_pending_future_runs_once_fulfilled() {
        let f: Future<i32> = Future::pending();
        let mapped = f.then(|x| x * 2);
        assert!(!mapped.is_ready());
        f.fulfill(21);
        assert_eq!(mapped.peek(), Some(42));
    }

    #[test]
    fn then_future_proxies_through_inner_future() {
        let f: Future<i32> = Future::pending();
        let inner: Future<i32> = Future::pending();
        let inner_for_closure = inner.clone();
        let out = f.then_future(move |x| inner_for_closure.then(move |y| x + y));
        assert!(!out.is_ready());
        f.fulfill(40);
        assert!(!out.is_ready());
        inner.fulfill(2);
        assert_eq!(out.peek(), Some(42));
    }

    #[test]
    fn when_all2_waits_for_both_antecedents() {
        let a: Future<i32> = Future::pending();
        let b: Future<&'static str> = Future::pending();
        let both = when_all2(a.clone(), b.clone());
        assert!(!both.is_ready());
        a.fulfill(1);
        assert!(!both.is_ready());
        b.fulfill("x");
        assert_eq!(both.peek(), Some((1, "x")));
    }

    #[test]
    fn when_all2_of_two_ready_futures_is_immediately_ready() {
        let both = when_all2(Future::ready(1), Future::ready("x"));
        assert_eq!(both.peek(), Some((1, "x")));
    }

    #[test]
    fn promise_scenario_matches_testable_property_5() {
        let p: Promise<i32> = Promise::new(3);
        p.fulfill_anonymous(1);
        p.fulfill_result(5);
        p.fulfill_anonymous(1);
        let f = p.finalize();
        assert_eq!(f.peek(), Some(5));
    }

    #[test]
    #[should_panic(expected = "fulfill_result called more than once")]
    fn fulfill_result_twice_panics() {
        let p: Promise<i32> = Promise::new(1);
        p.fulfill_result(1);
        p.fulfill_result(2);
    }

    #[test]
    fn multiple_get_future_calls_share_one_result() {
        let p: Promise<i32> = Promise::new(1);
        let f1 = p.get_future();
        let f2 = p.get_future();
        assert!(!f1.is_ready(), "must not settle before finalize");
        p.fulfill_result(9);
        assert!(!f1.is_ready(), "the n=1 unit belongs to fulfill_result; only finalize's implicit unit remains");
        p.finalize();
        assert_eq!(f1.peek(), Some(9));
        assert_eq!(f2.peek(), Some(9));
    }
}
