mod common;

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use promise_engine::{
        clear_possibly_unhandled_rejection, on_possibly_unhandled_rejection, scheduler, Promise,
        Reason,
    };

    use crate::common::{lab, ms, Reports, GRACE};

    #[derive(Debug, thiserror::Error)]
    #[error("propagation test")]
    struct Boom;

    #[derive(Debug, thiserror::Error)]
    #[error("cannot read property `will` of null")]
    struct TypeError;

    fn boom() -> Reason {
        Reason::error(Boom)
    }

    /// Reads a field of a value that turns out to be missing.
    fn use_value(value: Option<String>) -> Result<usize, Reason> {
        value.map(|v| v.len()).ok_or_else(|| Reason::error(TypeError))
    }

    /// Fails, recovers from the failure, then fails again with `fresh`.
    fn recover_then_fail(promise: &Promise<Option<String>>, fresh: Reason) -> Promise<()> {
        promise
            .then(use_value)
            .catch(|reason| {
                assert!(reason.is::<TypeError>());
                Ok(0)
            })
            .then(move |_| Err::<(), _>(fresh))
    }

    fn unhandled_branch(root: &Promise<()>) -> Promise<()> {
        root.then(|_| Ok(()))
            .then(|_| Ok(()))
            .derive()
            .then(|_| Ok(()))
    }

    fn handled_branch(root: &Promise<()>) -> Promise<()> {
        root.then(|_| Ok(())).then(|_| Ok(())).catch(|_| Ok(()))
    }

    fn deep_handled_sequence(root: &Promise<()>) -> Promise<()> {
        root.then(|_| Ok(()))
            .then(|_| Ok(()))
            .derive()
            .then(|_| Ok(()))
            .catch(|_| Ok(()))
    }

    // Rejections that are not handled in time.

    #[test]
    fn immediately_rejected_not_handled_at_all() {
        lab();
        let reports = Reports::install();
        let (resolver, _promise) = Promise::<()>::pending();
        let reason = boom();
        resolver.reject(reason.clone());
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].ptr_eq(&reason));
    }

    #[test]
    fn eventually_rejected_not_handled_at_all() {
        lab();
        let reports = Reports::install();
        let (resolver, _promise) = Promise::<()>::pending();
        scheduler::schedule_after(ms(50), move || resolver.reject(boom()));
        scheduler::advance(ms(50));
        assert_eq!(reports.count(), 0);
        scheduler::run();
        assert_eq!(reports.count(), 1);
    }

    #[test]
    fn immediately_rejected_handled_too_late() {
        lab();
        let reports = Reports::install();
        let (resolver, promise) = Promise::<()>::pending();
        resolver.reject(boom());
        let late = promise.clone();
        scheduler::schedule_after(ms(120), move || {
            let _ = late.catch(|_| Ok(()));
        });
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.promises()[0].refers_to(&promise));
    }

    #[test]
    fn eventually_rejected_handled_too_late() {
        lab();
        let reports = Reports::install();
        let (resolver, promise) = Promise::<()>::pending();
        scheduler::schedule_after(ms(20), move || resolver.reject(boom()));
        scheduler::schedule_after(ms(160), move || {
            let _ = promise.catch(|_| Ok(()));
        });
        scheduler::run();
        assert_eq!(reports.count(), 1);
    }

    #[test]
    fn handler_attached_inside_grace_window_retracts_report() {
        lab();
        let reports = Reports::install();
        let (resolver, promise) = Promise::<()>::pending();
        resolver.reject(boom());
        scheduler::schedule_after(GRACE / 2, move || {
            let _ = promise.catch(|_| Ok(()));
        });
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn report_is_delivered_once() {
        lab();
        let reports = Reports::install();
        let _rejected = Promise::<()>::rejected(boom());
        scheduler::run();
        scheduler::advance(GRACE * 10);
        scheduler::run();
        assert_eq!(reports.count(), 1);
    }

    // Rejections that are code errors.

    #[test]
    fn immediately_fulfilled_handled_with_erroneous_code() {
        lab();
        let reports = Reports::install();
        let (resolver, promise) = Promise::<Option<String>>::pending();
        resolver.fulfill(None);
        let _ = promise.then(use_value);
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].is::<TypeError>());
    }

    #[test]
    fn eventually_fulfilled_handled_with_erroneous_code() {
        lab();
        let reports = Reports::install();
        let (resolver, promise) = Promise::<Option<String>>::pending();
        scheduler::schedule_after(ms(40), move || resolver.fulfill(None));
        let _ = promise.then(use_value);
        scheduler::run();
        assert_eq!(reports.count(), 1);
    }

    #[test]
    fn already_fulfilled_recovered_then_failed_again() {
        lab();
        let reports = Reports::install();
        let fresh = boom();
        let _ = recover_then_fail(&Promise::fulfilled(None), fresh.clone());
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].ptr_eq(&fresh));
    }

    #[test]
    fn immediately_fulfilled_recovered_then_failed_again() {
        lab();
        let reports = Reports::install();
        let fresh = boom();
        let (resolver, promise) = Promise::pending();
        resolver.fulfill(None);
        let _ = recover_then_fail(&promise, fresh.clone());
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].ptr_eq(&fresh));
    }

    #[test]
    fn eventually_fulfilled_recovered_then_failed_again() {
        lab();
        let reports = Reports::install();
        let fresh = boom();
        let (resolver, promise) = Promise::pending();
        let _ = recover_then_fail(&promise, fresh.clone());
        scheduler::schedule_after(ms(40), move || resolver.fulfill(None));
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].ptr_eq(&fresh));
    }

    #[test]
    fn recovered_in_a_parallel_handler_then_failed_again() {
        lab();
        let reports = Reports::install();
        let fresh = boom();
        let promise = Promise::<Option<String>>::fulfilled(None);
        let _ = promise.then(use_value).catch(|reason| {
            assert!(reason.is::<TypeError>());
            Ok(0)
        });
        let again = fresh.clone();
        let _ = promise
            .catch(|_| Ok(None))
            .then(move |_| Err::<(), _>(again));
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].ptr_eq(&fresh));
    }

    // Rejections with reasons that are not errors.

    #[derive(Debug)]
    struct Plain {
        field: u8,
    }

    #[test]
    fn immediately_rejected_with_plain_value() {
        lab();
        let reports = Reports::install();
        let (resolver, _promise) = Promise::<()>::pending();
        resolver.reject(Reason::new(Plain { field: 3 }));
        scheduler::run();
        let reasons = reports.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(!reasons[0].is_error());
        assert_eq!(reasons[0].downcast_ref::<Plain>().map(|p| p.field), Some(3));
    }

    #[test]
    fn eventually_rejected_with_plain_value() {
        lab();
        let reports = Reports::install();
        let (resolver, _promise) = Promise::<()>::pending();
        scheduler::schedule_after(ms(80), move || resolver.reject(Reason::new(Vec::<u8>::new())));
        scheduler::run();
        let reasons = reports.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].is::<Vec<u8>>());
    }

    #[derive(Debug)]
    struct Frozen {
        label: &'static str,
    }

    #[test]
    fn frozen_reason_survives_reporting() {
        lab();
        let formatted = Rc::new(std::cell::RefCell::new(String::new()));
        let sink = formatted.clone();
        on_possibly_unhandled_rejection(move |reason, promise| {
            *sink.borrow_mut() = format!("{reason} / {reason:?} / {promise:?}");
        });
        let shared = Rc::new(Frozen { label: "ice" });
        let reason = Reason::new(shared.clone());
        let _rejected = Promise::<()>::rejected(reason.clone());
        scheduler::run();
        assert!(formatted.borrow().contains("ice"));
        let delivered = reason.downcast_ref::<Rc<Frozen>>().unwrap();
        assert!(Rc::ptr_eq(delivered, &shared));
    }

    #[test]
    fn frozen_error_reason_is_reported() {
        lab();
        let reports = Reports::install();
        let (resolver, _promise) = Promise::<()>::pending();
        scheduler::schedule_after(ms(80), move || resolver.reject(Reason::error(Boom)));
        scheduler::run();
        let reasons = reports.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].is_error());
        assert_eq!(reasons[0].to_string(), "propagation test");
    }

    // Rejections that are handled in time.

    #[test]
    fn already_rejected_handled() {
        lab();
        let reports = Reports::install();
        let failed = Promise::<()>::rejected(boom());
        let _ = failed.catch(|_| Ok(()));
        scheduler::advance(ms(34));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn immediately_rejected_handled() {
        lab();
        let reports = Reports::install();
        let (resolver, failed) = Promise::<()>::pending();
        let _ = failed.catch(|_| Ok(()));
        resolver.reject(boom());
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn eventually_rejected_handled() {
        lab();
        let reports = Reports::install();
        let (resolver, failed) = Promise::<()>::pending();
        let _ = failed.catch(|_| Ok(()));
        scheduler::schedule_after(ms(13), move || resolver.reject(boom()));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn already_rejected_handled_in_a_deep_sequence() {
        lab();
        let reports = Reports::install();
        let failed = Promise::<()>::rejected(boom());
        let _ = deep_handled_sequence(&failed);
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn immediately_rejected_handled_in_a_deep_sequence() {
        lab();
        let reports = Reports::install();
        let (resolver, failed) = Promise::<()>::pending();
        let _ = deep_handled_sequence(&failed);
        resolver.reject(boom());
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn eventually_handled_in_a_deep_sequence() {
        lab();
        let reports = Reports::install();
        let (resolver, failed) = Promise::<()>::pending();
        let _ = deep_handled_sequence(&failed);
        scheduler::schedule_after(ms(13), move || resolver.reject(boom()));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    // Parallel branches: only the branches without a handler are reported.

    #[test]
    fn already_rejected_handled_in_a_middle_parallel_branch() {
        lab();
        let reports = Reports::install();
        let reason = boom();
        let failed = Promise::<()>::rejected(reason.clone());
        let first = unhandled_branch(&failed);
        let _ = handled_branch(&failed);
        let third = unhandled_branch(&failed);
        scheduler::run();
        assert_eq!(reports.count(), 2);
        assert!(reports.reasons().iter().all(|r| r.ptr_eq(&reason)));
        let promises = reports.promises();
        assert!(promises.iter().any(|p| p.refers_to(&first)));
        assert!(promises.iter().any(|p| p.refers_to(&third)));
    }

    #[test]
    fn immediately_rejected_handled_in_a_middle_parallel_branch() {
        lab();
        let reports = Reports::install();
        let (resolver, failed) = Promise::<()>::pending();
        let _ = unhandled_branch(&failed);
        let _ = handled_branch(&failed);
        let _ = unhandled_branch(&failed);
        resolver.reject(boom());
        scheduler::run();
        assert_eq!(reports.count(), 2);
    }

    #[test]
    fn eventually_rejected_handled_in_a_middle_parallel_branch() {
        lab();
        let reports = Reports::install();
        let (resolver, failed) = Promise::<()>::pending();
        let _ = unhandled_branch(&failed);
        let _ = handled_branch(&failed);
        let _ = unhandled_branch(&failed);
        scheduler::schedule_after(ms(13), move || resolver.reject(boom()));
        scheduler::run();
        assert_eq!(reports.count(), 2);
    }

    #[test]
    fn reports_once_per_unhandled_branch() {
        lab();
        let reports = Reports::install();
        let failed = Promise::<()>::rejected(boom());
        let handled = [true, false, true, false, false];
        for &handles in &handled {
            let _ = if handles {
                handled_branch(&failed)
            } else {
                unhandled_branch(&failed)
            };
        }
        scheduler::run();
        let unhandled = handled.iter().filter(|&&h| !h).count();
        assert_eq!(reports.count(), unhandled);
    }

    // Immediate failures.

    #[test]
    fn rejected_constructor_without_handler() {
        lab();
        let reports = Reports::install();
        let err = boom();
        let _rejected = Promise::<()>::rejected(err.clone());
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.reasons()[0].ptr_eq(&err));
    }

    #[test]
    fn rejected_constructor_with_handler() {
        lab();
        let reports = Reports::install();
        let _ = Promise::<()>::rejected(boom()).catch(|_| Ok(()));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    // A continuation returning a promise that rejects.

    #[test]
    fn returned_promise_eventually_rejected() {
        lab();
        let reports = Reports::install();
        let _ = Promise::fulfilled(())
            .and_then(|()| {
                let (resolver, promise) = Promise::<()>::pending();
                scheduler::schedule_after(ms(13), move || resolver.reject(Reason::new(13)));
                promise
            })
            .catch(|_| Ok(()));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn returned_promise_already_rejected() {
        lab();
        let reports = Reports::install();
        let _ = Promise::fulfilled(())
            .and_then(|()| Promise::<()>::rejected(Reason::new(13)))
            .catch(|_| Ok(()));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn returned_promise_immediately_rejected() {
        lab();
        let reports = Reports::install();
        let _ = Promise::fulfilled(())
            .and_then(|()| {
                let (resolver, promise) = Promise::<()>::pending();
                resolver.reject(Reason::new(13));
                promise
            })
            .catch(|_| Ok(()));
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }

    #[test]
    fn returned_promise_rejected_without_handler_is_reported_once() {
        lab();
        let reports = Reports::install();
        let outer = Promise::fulfilled(()).and_then(|()| Promise::<()>::rejected(Reason::new(13)));
        scheduler::run();
        assert_eq!(reports.count(), 1);
        assert!(reports.promises()[0].refers_to(&outer));
    }

    // Hook lifecycle.

    #[test]
    fn noop_hook_stops_reporting() {
        lab();
        let reports = Reports::install();
        let _first = Promise::<()>::rejected(boom());
        scheduler::run();
        on_possibly_unhandled_rejection(|_, _| {});
        let _second = Promise::<()>::rejected(boom());
        scheduler::run();
        assert_eq!(reports.count(), 1);
    }

    #[test]
    fn cleared_hook_stops_reporting() {
        lab();
        let reports = Reports::install();
        let _rejected = Promise::<()>::rejected(boom());
        clear_possibly_unhandled_rejection();
        scheduler::run();
        assert_eq!(reports.count(), 0);
    }
}
