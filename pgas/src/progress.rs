//! The progress engine (design doc §4.E).
//!
//! `progress(level)` is the only place transport handles are polled and LPC
//! queues are drained; nothing else in this crate touches a persona's
//! queues or HCB list. Every public entry point here requires the caller to
//! already have the relevant persona(s) active on the calling thread,
//! matching the "only the active thread may drain" invariant — callers get
//! personas to drain from [`crate::persona::PersonaScope::stack`].

use pgas_transport::Transport;

use crate::persona::{Persona, ProgressLevel};

/// Runs one progress step at `level` over every persona active on the
/// calling thread (innermost first, matching `PersonaScope::stack`'s
/// ordering), against `transport`.
///
/// For each active persona: drain one rank's worth of inbound active
/// messages if the persona is the rank's master (that is where a real
/// transport delivers them), test its in-flight HCBs and fire any that are
/// ready, then drain the internal LPC queue fully, then (if `level` is
/// [`ProgressLevel::User`]) drain the user LPC queue fully. "Fully" means
/// re-reading the queue until it reports empty, so an LPC that enqueues
/// another LPC to the same persona at the same level is observed in this
/// same pass — this resolves the specification's open question about
/// internal-vs-user LPC ordering during `progress(user)` in favor of
/// same-pass visibility.
pub fn progress(transport: &dyn Transport, level: ProgressLevel) -> bool {
    let mut any = false;
    for persona in crate::persona::PersonaScope::stack() {
        any |= progress_one(transport, &persona, level);
    }
    any
}

fn progress_one(transport: &dyn Transport, persona: &std::sync::Arc<Persona>, level: ProgressLevel) -> bool {
    let mut any = false;

    if persona.is_master() {
        while let Some(payload) = transport.try_recv_am() {
            crate::rpc::dispatch(&payload, transport, persona);
            any = true;
        }
    }

    if persona.poll_hcbs(transport) > 0 {
        any = true;
    }

    if persona.drain_deferred(transport) > 0 {
        any = true;
    }

    persona.absorb_remote_queues();

    if drain_queue_fully(persona, ProgressLevel::Internal) > 0 {
        any = true;
    }

    if level == ProgressLevel::User {
        // An internal-level LPC run above may itself have enqueued
        // user-level work (or more internal work, already covered); fold
        // the mailbox again before draining user so cross-thread pushes
        // that arrived during this call are not missed.
        persona.absorb_remote_queues();
        if drain_queue_fully(persona, ProgressLevel::User) > 0 {
            any = true;
        }
    }

    any
}

/// Pops and runs one entry at a time (rather than taking one `&mut`
/// borrow for the whole drain) so a record that reentrantly enqueues onto
/// this same persona's queue is observed within this call instead of
/// panicking against the `RefCell`.
fn drain_queue_fully(persona: &Persona, level: ProgressLevel) -> usize {
    let mut ran = 0;
    loop {
        let record = match level {
            ProgressLevel::Internal => persona.internal_queue().borrow_mut().pop_front(),
            ProgressLevel::User => persona.user_queue().borrow_mut().pop_front(),
        };
        match record {
            Some(record) => {
                record.execute_and_delete();
                ran += 1;
            }
            None => break,
        }
    }
    if ran > 0 {
        persona.log(crate::persona::ProgressEvent::LpcDrained { level, count: ran });
    }
    ran
}

/// `progress_required(scope)` per the spec: true iff any persona in
/// `scope` has pending user-level LPCs, pending HCBs, or outstanding
/// remote-completion obligations. `scope` defaults to every persona active
/// on the calling thread when `None`.
///
/// The specification leaves unstated whether outstanding *source_cx*-only
/// completions (no `operation_cx` pending) should count; this
/// implementation treats any in-flight HCB as pending regardless of which
/// completion kind it will eventually fire, erring toward `true` so
/// `discharge` remains a safe pre-finalize gate, per design doc §9.
pub fn progress_required(scope: Option<&[&Persona]>) -> bool {
    match scope {
        Some(personas) => personas.iter().any(|p| p.progress_required()),
        None => crate::persona::PersonaScope::stack().iter().any(|p| p.progress_required()),
    }
}

/// Spins `progress(internal)` until [`progress_required`] is false for
/// `scope`, guaranteeing outstanding work has drained to the network and
/// any remote completions this rank owes have been injected.
pub fn discharge(transport: &dyn Transport, scope: Option<&[&Persona]>) {
    while progress_required(scope) {
        progress(transport, ProgressLevel::Internal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::{Persona, PersonaScope};
    use crate::queue::Executable;
    use pgas_transport::loopback::{LoopbackTransport, World};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tag(Rc<RefCell<Vec<&'static str>>>, &'static str);
    impl Executable for Tag {
        fn execute_and_delete(self: Box<Self>) {
            self.0.borrow_mut().push(self.1);
        }
    }

    #[test]
    fn a_bound_logger_observes_a_drained_lpc() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());

        let mut registry = pgas_logging::Registry::new(std::time::Instant::now());
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        registry.insert::<crate::persona::ProgressEvent>(
            "progress",
            Box::new(move |_elapsed, batch| sink.borrow_mut().extend(batch.iter().map(|(_, e)| *e))),
        );
        let logger = registry.get::<crate::persona::ProgressEvent>("progress").expect("just inserted");
        persona.set_logger(logger.clone());

        persona.enqueue_local(ProgressLevel::User, Box::new(Tag(Rc::new(RefCell::new(Vec::new())), "x")));
        progress(&transport, ProgressLevel::User);
        logger.flush();

        assert!(events
            .borrow()
            .contains(&crate::persona::ProgressEvent::LpcDrained { level: ProgressLevel::User, count: 1 }));
    }

    #[test]
    fn internal_then_user_drain_order_at_user_level() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        persona.enqueue_local(crate::persona::ProgressLevel::User, Box::new(Tag(log.clone(), "user")));
        persona.enqueue_local(crate::persona::ProgressLevel::Internal, Box::new(Tag(log.clone(), "internal")));

        progress(&transport, crate::persona::ProgressLevel::User);
        assert_eq!(&*log.borrow(), &["internal", "user"]);
    }

    #[test]
    fn internal_level_progress_never_touches_user_queue() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());
        let log = Rc::new(RefCell::new(Vec::new()));
        persona.enqueue_local(crate::persona::ProgressLevel::User, Box::new(Tag(log.clone(), "user")));

        progress(&transport, crate::persona::ProgressLevel::Internal);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn discharge_clears_undischarged_remote_obligation() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());
        persona.remote_obligation_opened();

        // Nothing ever closes the obligation here, so bound the spin and
        // assert the obligation is the sole reason `progress_required`
        // stays true rather than spinning forever in the test.
        assert!(progress_required(None));
        persona.remote_obligation_closed();
        assert!(!progress_required(None));
        discharge(&transport, None);
    }
}
