use super::*;
use std::{
    cell::Cell,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
    time::Duration,
};
use tokio::time::sleep;

fn context() -> Context<&'static str> {
    create_context(ContextOptions::default())
}

#[test]
fn call_and_use() {
    let ctx = context();
    assert!(ctx.try_use().is_none());
    assert_eq!(ctx.use_value(), Err(ContextError::Unavailable));

    let a = Rc::new("A");
    let res = ctx
        .call(Rc::clone(&a), || {
            assert_eq!(*ctx.use_value().expect("bound"), "A");
            assert_eq!(*ctx.use_value().expect("bound"), "A");
            "OK"
        })
        .expect("no conflict");
    assert_eq!(res, "OK");
    assert!(ctx.try_use().is_none());
}

#[test]
fn call_detects_conflicts_by_identity() {
    let ctx = context();
    let a = Rc::new("A");
    ctx.call(Rc::clone(&a), || {
        let nested = ctx.call(Rc::new("B"), || unreachable!("conflicting call must not run"));
        assert_eq!(nested, Err(ContextError::Conflict));

        // Re-entering with the very same value is allowed.
        let same = ctx.call(Rc::clone(&a), || "same");
        assert_eq!(same, Ok("same"));
    })
    .expect("outer call");

    // Equal contents are still a different value.
    ctx.set(Rc::new("A"), false).expect("empty slot");
    assert_eq!(ctx.set(Rc::new("A"), false), Err(ContextError::Conflict));
    ctx.set(Rc::new("B"), true).expect("replace skips the check");
    assert_eq!(*ctx.use_value().expect("bound"), "B");
}

#[test]
fn singleton_survives_bracketed_calls() {
    let ctx = context();
    let app = Rc::new("app");
    ctx.set(Rc::clone(&app), false).expect("set");
    ctx.call(Rc::clone(&app), || {
        assert!(Rc::ptr_eq(&ctx.use_value().expect("bound"), &app));
    })
    .expect("same value");
    assert!(Rc::ptr_eq(&ctx.use_value().expect("still bound"), &app));

    ctx.unset();
    assert!(ctx.try_use().is_none());
}

#[test]
fn binding_is_released_when_body_panics() {
    let ctx = context();
    let result = catch_unwind(AssertUnwindSafe(|| {
        ctx.call(Rc::new("A"), || panic!("body failed"))
    }));
    assert!(result.is_err());
    assert!(ctx.try_use().is_none());

    let value = ctx
        .call(Rc::new("B"), || *ctx.use_value().expect("bound"))
        .expect("no stale binding");
    assert_eq!(value, "B");
    assert!(ctx.try_use().is_none());
}

#[test]
fn namespace_returns_the_same_context_per_key() {
    let ns = create_namespace(NamespaceOptions::default());
    let first = ns.get::<String>("A").expect("create");
    let second = ns.get::<String>("A").expect("lookup");
    assert!(first.ptr_eq(&second));
    assert!(ns.contains("A"));

    let other = ns.get::<String>("B").expect("create");
    assert!(!first.ptr_eq(&other));

    assert_eq!(
        ns.get::<u32>("A").err(),
        Some(ContextError::TypeMismatch {
            key: "A".to_string()
        })
    );
}

#[test]
fn namespace_builds_options_only_for_missing_contexts() {
    let ns = create_namespace(NamespaceOptions {
        async_context: true,
    });
    let built = Cell::new(0);
    let make = || {
        built.set(built.get() + 1);
        ContextOptions::<u32>::default()
    };

    let first = ns.get_or_insert_with("A", make).expect("create");
    let second = ns.get_or_insert_with("A", make).expect("lookup");
    let third = ns.get::<u32>("A").expect("lookup");
    assert_eq!(built.get(), 1);
    assert!(first.ptr_eq(&second));
    assert!(first.ptr_eq(&third));
}

#[test]
fn default_namespace_is_shared() {
    let ctx = get_context::<u32>("shared").expect("create");
    ctx.set(Rc::new(7), false).expect("set");
    assert!(default_namespace().contains("shared"));
    assert_eq!(*use_context::<u32>("shared").expect("bound"), 7);
    assert!(Rc::ptr_eq(&default_namespace(), &default_namespace()));
}

#[tokio::test(flavor = "current_thread")]
async fn call_async_loses_the_value_after_suspension_without_restore() {
    let ctx = context();
    let inner = ctx.clone();
    let res = ctx
        .call_async(Rc::new("A"), || async move {
            assert_eq!(*inner.use_value().expect("sync prefix"), "A");
            tokio::task::yield_now().await;
            assert!(inner.try_use().is_none());
            "OK"
        })
        .await
        .expect("no conflict");
    assert_eq!(res, "OK");
}

#[tokio::test(flavor = "current_thread")]
async fn interleaved_calls_stay_isolated_with_restore() {
    let ctx = context();

    let run = |name: &'static str, ms: u64| {
        let inner = ctx.clone();
        ctx.call_async(Rc::new(name), move || async move {
            assert_eq!(*inner.use_value().expect("bound before suspending"), name);
            // What a rewritten `await sleep(ms)` expands to.
            let (eventual, restore) = execute_async(|| sleep(Duration::from_millis(ms)));
            eventual.await;
            restore.restore();
            assert_eq!(*inner.use_value().expect("restored"), name);
            inner.use_value()
        })
    };

    let (a, b, c) = futures::join!(run("A", 1), run("B", 1), run("C", 5));
    let names: Vec<&str> = [a, b, c]
        .into_iter()
        .map(|res| *res.expect("no conflict").expect("bound"))
        .collect();
    assert_eq!(names, ["A", "B", "C"]);
    assert!(ctx.try_use().is_none());
    assert_eq!(registered_handlers(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn scoped_storage_keeps_value_across_suspensions() {
    let storage: Rc<dyn ScopedStorage<&'static str>> = Rc::new(ScopeStack::new());
    let ctx = create_context(ContextOptions::with_storage(storage));
    assert!(ctx.try_use().is_none());

    let run = |name: &'static str, ms: u64| {
        let inner = ctx.clone();
        ctx.call_async(Rc::new(name), move || async move {
            assert_eq!(*inner.use_value().expect("bound"), name);
            sleep(Duration::from_millis(ms)).await;
            inner.use_value()
        })
    };

    let (a, b, c) = futures::join!(run("A", 1), run("B", 2), run("C", 5));
    let names: Vec<&str> = [a, b, c]
        .into_iter()
        .map(|res| *res.expect("no conflict").expect("bound"))
        .collect();
    assert_eq!(names, ["A", "B", "C"]);
    assert!(ctx.try_use().is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn leave_handler_is_removed_when_call_is_dropped() {
    let ctx = context();
    let mut call = Box::pin(ctx.call_async(Rc::new("A"), || sleep(Duration::from_secs(60))));

    assert!(futures::poll!(call.as_mut()).is_pending());
    assert_eq!(registered_handlers(), 1);
    assert!(ctx.try_use().is_none());

    drop(call);
    assert_eq!(registered_handlers(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn call_async_reports_conflicts_before_running() {
    let ctx = context();
    ctx.set(Rc::new("app"), false).expect("set");
    let res = ctx
        .call_async(Rc::new("other"), || async {
            unreachable!("must not run");
        })
        .await;
    assert!(matches!(res, Err(ContextError::Conflict)));
    assert_eq!(registered_handlers(), 0);
}
