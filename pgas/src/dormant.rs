//! Dormant LPCs: suspended continuations addressable across ranks
//! (design doc §4.G).
//!
//! A dormant LPC is built on one rank, its address handed to a peer on
//! the wire, and fired from wherever that peer's completion code runs —
//! which, for [`crate::rpc`]'s loopback transport, is simply another
//! thread in this same process. That is exactly the case the original's
//! raw-pointer trick assumes (same binary loaded once, shared address
//! space on that node), so `Box::into_raw`/`Box::from_raw` is not a
//! simplification here so much as the literal mechanism, minus the low
//! vtable-pointer bit the original uses to distinguish the function and
//! quiesced-promise shapes — Rust gets that distinction for free from
//! the `Body` enum instead.

use std::sync::Arc;

use crate::future::Promise;
use crate::persona::{Persona, ProgressLevel};
use crate::queue::{Executable, Record};

enum Body<T: Clone + 'static> {
    Function(Box<dyn FnOnce(T)>),
    Promise(Promise<T>),
}

/// An LPC whose argument will be constructed later, possibly by a
/// different rank than the one that built it.
pub struct DormantLpc<T: Clone + 'static> {
    persona: Arc<Persona>,
    level: ProgressLevel,
    next: Option<Box<DormantLpc<T>>>,
    body: Body<T>,
}

impl<T: Clone + 'static> DormantLpc<T> {
    /// A dormant LPC that, once fired, runs `f` with the delivered value
    /// on `persona` at `level`.
    pub fn new_function<F>(persona: Arc<Persona>, level: ProgressLevel, f: F) -> Self
    where
        F: FnOnce(T) + 'static,
    {
        DormantLpc { persona, level, next: None, body: Body::Function(Box::new(f)) }
    }

    /// A dormant LPC that, once fired, fulfills `promise`'s result with
    /// the delivered value.
    pub fn new_promise(persona: Arc<Persona>, level: ProgressLevel, promise: Promise<T>) -> Self {
        DormantLpc { persona, level, next: None, body: Body::Promise(promise) }
    }

    /// Chains `next` behind this dormant LPC: firing the head fires the
    /// whole chain, delivering a clone of the result to every element but
    /// the last, which receives it by move.
    pub fn chain(mut self, next: DormantLpc<T>) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    /// Leaks this dormant LPC onto the heap and returns a wire-stable
    /// address for it. Must be paired with exactly one
    /// [`Self::fire_from_wire`] call on the same `T`.
    pub fn into_wire_address(self) -> u64 {
        Box::into_raw(Box::new(self)) as u64
    }

    /// Reconstitutes a dormant LPC chain previously produced by
    /// [`Self::into_wire_address`] and fires it with `result`.
    ///
    /// # Safety
    ///
    /// `addr` must be a value this process's own [`Self::into_wire_address`]
    /// returned for a `DormantLpc<T>` with this exact `T`, and must not
    /// have already been consumed by a prior call.
    pub unsafe fn fire_from_wire(addr: u64, result: T) {
        let head = Box::from_raw(addr as *mut DormantLpc<T>);
        head.fire(result);
    }

    fn fire(self, result: T) {
        let DormantLpc { persona, level, next, body } = self;
        if let Some(next) = next {
            next.fire(result.clone());
        }
        let record: Record = match body {
            Body::Function(f) => Box::new(FunctionRecord { f: Some(f), value: Some(result) }),
            Body::Promise(p) => Box::new(PromiseRecord { promise: Some(p), value: Some(result) }),
        };
        // `enqueue_remote` rather than `enqueue_local`: the firing thread
        // is, in general, not the thread `persona` is active on.
        persona.enqueue_remote(level, record);
    }
}

struct FunctionRecord<T> {
    f: Option<Box<dyn FnOnce(T)>>,
    value: Option<T>,
}

impl<T> Executable for FunctionRecord<T> {
    fn execute_and_delete(mut self: Box<Self>) {
        (self.f.take().expect("fired once"))(self.value.take().expect("fired once"));
    }
}

struct PromiseRecord<T: Clone + 'static> {
    promise: Option<Promise<T>>,
    value: Option<T>,
}

impl<T: Clone + 'static> Executable for PromiseRecord<T> {
    fn execute_and_delete(mut self: Box<Self>) {
        let value = self.value.take().expect("fired once");
        self.promise.take().expect("fired once").fulfill_result(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;
    use pgas_transport::loopback::{LoopbackTransport, World};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn function_dormant_fires_on_its_target_persona() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = crate::persona::PersonaScope::activate(persona.clone());
        let log = Rc::new(RefCell::new(None));

        let log_for_fn = log.clone();
        let dormant = DormantLpc::new_function(persona.clone(), ProgressLevel::User, move |v: i32| {
            *log_for_fn.borrow_mut() = Some(v);
        });
        let addr = dormant.into_wire_address();

        unsafe { DormantLpc::fire_from_wire(addr, 42) };
        progress::progress(&transport, ProgressLevel::User);
        assert_eq!(*log.borrow(), Some(42));
    }

    #[test]
    fn chained_dormants_clone_to_all_but_the_last() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = crate::persona::PersonaScope::activate(persona.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        let l1 = log.clone();
        let l2 = log.clone();
        let first = DormantLpc::new_function(persona.clone(), ProgressLevel::User, move |v: i32| l1.borrow_mut().push(v));
        let second = DormantLpc::new_function(persona.clone(), ProgressLevel::User, move |v: i32| l2.borrow_mut().push(v * 10));
        let chained = first.chain(second);
        let addr = chained.into_wire_address();

        unsafe { DormantLpc::fire_from_wire(addr, 7) };
        progress::progress(&transport, ProgressLevel::User);
        let mut seen = log.borrow().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![7, 70]);
    }

    #[test]
    fn promise_dormant_fulfills_result() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = crate::persona::PersonaScope::activate(persona.clone());

        let promise: Promise<i32> = Promise::new(1);
        let future = promise.finalize();
        let dormant = DormantLpc::new_promise(persona.clone(), ProgressLevel::User, promise);
        let addr = dormant.into_wire_address();

        unsafe { DormantLpc::fire_from_wire(addr, 99) };
        progress::progress(&transport, ProgressLevel::User);
        assert_eq!(future.peek(), Some(99));
    }
}
