//! End-to-end execution semantics: memoization, concurrency, MultiGet
//! ordering, outcome propagation, and cycle detection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rule_flow::{
    rule_fn, DependencyKey, Param, Params, Registry, RootQuery, Rule, RuleGraph, Scheduler,
    Session, TypeKey, Value,
};

#[derive(Debug, Hash, PartialEq, Eq)]
struct SubjectA;
#[derive(Debug, Hash, PartialEq, Eq)]
struct SourceC;
#[derive(Debug, Hash, PartialEq, Eq)]
struct MidB(u32);
#[derive(Debug, PartialEq)]
struct Rendered(String);

/// The transitive-composition engine: `derive_mid(C) -> B` and
/// `render(A, B) -> Rendered`.
fn composition_engine() -> Scheduler {
    let mut registry = Registry::new();
    registry
        .register(Rule::new(
            "derive_mid",
            TypeKey::of::<MidB>(),
            vec![DependencyKey::Select(TypeKey::of::<SourceC>())],
            rule_fn(|ctx| {
                Box::pin(async move {
                    let _source = ctx.select::<SourceC>().await?;
                    Ok(Value::new(MidB(7)))
                })
            }),
        ))
        .unwrap();
    registry
        .register(Rule::new(
            "render",
            TypeKey::of::<Rendered>(),
            vec![
                DependencyKey::Select(TypeKey::of::<SubjectA>()),
                DependencyKey::Select(TypeKey::of::<MidB>()),
            ],
            rule_fn(|ctx| {
                Box::pin(async move {
                    let _a = ctx.select::<SubjectA>().await?;
                    let b = ctx.select::<MidB>().await?;
                    Ok(Value::new(Rendered(format!("a+{}", b.0))))
                })
            }),
        ))
        .unwrap();

    let graph = RuleGraph::compile(
        &registry,
        vec![
            RootQuery::new(
                TypeKey::of::<Rendered>(),
                [TypeKey::of::<SubjectA>(), TypeKey::of::<SourceC>()],
            ),
            RootQuery::new(
                TypeKey::of::<Rendered>(),
                [TypeKey::of::<SubjectA>(), TypeKey::of::<MidB>()],
            ),
        ],
    )
    .unwrap();
    Scheduler::builder().worker_count(8).build(graph)
}

#[tokio::test]
async fn transitive_composition_matches_direct_request() {
    let scheduler = composition_engine();
    let session = Session::new();

    // Via derive_mid: B is computed from C.
    let transitive = scheduler
        .product_request(
            &session,
            TypeKey::of::<Rendered>(),
            [Params::new([Param::new(SubjectA), Param::new(SourceC)])],
        )
        .await
        .unwrap();

    // Direct: B is a subject param.
    let direct = scheduler
        .product_request(
            &session,
            TypeKey::of::<Rendered>(),
            [Params::new([Param::new(SubjectA), Param::new(MidB(7))])],
        )
        .await
        .unwrap();

    let transitive = transitive[0].downcast::<Rendered>().unwrap();
    let direct = direct[0].downcast::<Rendered>().unwrap();
    assert_eq!(*transitive, *direct);
    assert_eq!(transitive.0, "a+7");
}

mod memoization {
    use super::*;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Src(u32);
    #[derive(Debug, PartialEq)]
    struct Parsed(u32);

    fn engine(counter: Arc<AtomicUsize>) -> Scheduler {
        let mut registry = Registry::new();
        registry
            .register(Rule::new(
                "parse",
                TypeKey::of::<Parsed>(),
                vec![DependencyKey::Select(TypeKey::of::<Src>())],
                rule_fn(move |ctx| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let src = ctx.select::<Src>().await?;
                        Ok(Value::new(Parsed(src.0 * 10)))
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(
                TypeKey::of::<Parsed>(),
                [TypeKey::of::<Src>()],
            )],
        )
        .unwrap();
        Scheduler::builder().worker_count(8).build(graph)
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_execution() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = engine(counter.clone());
        let subject = || [Params::single(Param::new(Src(4)))];

        let session_a = Session::new();
        let session_b = Session::new();
        let (a, b) = tokio::join!(
            scheduler.product_request(&session_a, TypeKey::of::<Parsed>(), subject()),
            scheduler.product_request(&session_b, TypeKey::of::<Parsed>(), subject()),
        );
        let a = a.unwrap()[0].downcast::<Parsed>().unwrap();
        let b = b.unwrap()[0].downcast::<Parsed>().unwrap();

        // All callers observe the identical outcome from one execution.
        assert_eq!(*a, *b);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn later_sessions_reuse_cached_results() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = engine(counter.clone());

        for _ in 0..3 {
            let session = Session::new();
            let values = scheduler
                .product_request(
                    &session,
                    TypeKey::of::<Parsed>(),
                    [Params::single(Param::new(Src(2)))],
                )
                .await
                .unwrap();
            assert_eq!(values[0].downcast::<Parsed>().unwrap().0, 20);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

mod concurrency {
    use super::*;
    use tokio::sync::Barrier;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Src(u32);
    #[derive(Debug)]
    struct Done;

    #[tokio::test]
    async fn independent_nodes_run_concurrently() {
        // Both bodies must reach the barrier for either to complete: if the
        // scheduler serialized independent nodes this would never finish.
        let barrier = Arc::new(Barrier::new(2));
        let mut registry = Registry::new();
        registry
            .register(Rule::new(
                "sync_point",
                TypeKey::of::<Done>(),
                vec![DependencyKey::Select(TypeKey::of::<Src>())],
                rule_fn(move |ctx| {
                    let barrier = barrier.clone();
                    Box::pin(async move {
                        let _src = ctx.select::<Src>().await?;
                        barrier.wait().await;
                        Ok(Value::new(Done))
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(TypeKey::of::<Done>(), [TypeKey::of::<Src>()])],
        )
        .unwrap();
        let scheduler = Scheduler::builder().worker_count(4).build(graph);

        let session = Session::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.product_request(
                &session,
                TypeKey::of::<Done>(),
                [
                    Params::single(Param::new(Src(1))),
                    Params::single(Param::new(Src(2))),
                ],
            ),
        )
        .await
        .expect("independent nodes were serialized");
        assert_eq!(result.unwrap().len(), 2);
    }
}

mod multiget {
    use super::*;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Src(u32);
    #[derive(Debug, PartialEq)]
    struct Parsed(u32);
    #[derive(Debug, PartialEq)]
    struct Totals(Vec<u32>);

    #[tokio::test]
    async fn results_arrive_in_request_order() {
        let mut registry = Registry::new();
        registry
            .register(Rule::new(
                "parse_one",
                TypeKey::of::<Parsed>(),
                vec![DependencyKey::Select(TypeKey::of::<Src>())],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let src = ctx.select::<Src>().await?;
                        // Later requests complete earlier.
                        tokio::time::sleep(Duration::from_millis((4 - src.0 as u64) * 40)).await;
                        Ok(Value::new(Parsed(src.0 * 10)))
                    })
                }),
            ))
            .unwrap();
        registry
            .register(Rule::new(
                "parse_all",
                TypeKey::of::<Totals>(),
                vec![DependencyKey::Get {
                    output: TypeKey::of::<Parsed>(),
                    input: TypeKey::of::<Src>(),
                }],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let parsed = ctx
                            .get_many::<Parsed>([
                                Param::new(Src(3)),
                                Param::new(Src(1)),
                                Param::new(Src(2)),
                            ])
                            .await?;
                        Ok(Value::new(Totals(parsed.iter().map(|p| p.0).collect())))
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(TypeKey::of::<Totals>(), [])],
        )
        .unwrap();
        let scheduler = Scheduler::builder().worker_count(8).build(graph);

        let session = Session::new();
        let values = scheduler
            .product_request(&session, TypeKey::of::<Totals>(), [Params::default()])
            .await
            .unwrap();
        let totals = values[0].downcast::<Totals>().unwrap();
        assert_eq!(totals.0, vec![30, 10, 20]);
    }
}

mod outcomes {
    use super::*;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Src(u32);
    #[derive(Debug)]
    struct FailOut;
    #[derive(Debug, PartialEq)]
    struct Wrapped(&'static str);

    #[derive(Debug, Clone, PartialEq)]
    struct ToolError {
        exit_code: i32,
    }

    impl std::fmt::Display for ToolError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "tool exited with {}", self.exit_code)
        }
    }

    impl std::error::Error for ToolError {}

    fn failing_engine() -> Scheduler {
        let mut registry = Registry::new();
        registry
            .register(Rule::new(
                "run_tool",
                TypeKey::of::<FailOut>(),
                vec![DependencyKey::Select(TypeKey::of::<Src>())],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let _src = ctx.select::<Src>().await?;
                        Err(ToolError { exit_code: 42 }.into())
                    })
                }),
            ))
            .unwrap();
        registry
            .register(Rule::new(
                "wrap_tool",
                TypeKey::of::<Wrapped>(),
                vec![
                    DependencyKey::Select(TypeKey::of::<Src>()),
                    DependencyKey::Get {
                        output: TypeKey::of::<FailOut>(),
                        input: TypeKey::of::<Src>(),
                    },
                ],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let src = ctx.select::<Src>().await?;
                        let _dep = ctx.get::<FailOut>(Param::new(Src(src.0))).await?;
                        Ok(Value::new(Wrapped("unreachable")))
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(
                TypeKey::of::<Wrapped>(),
                [TypeKey::of::<Src>()],
            )],
        )
        .unwrap();
        Scheduler::builder().worker_count(4).build(graph)
    }

    #[tokio::test]
    async fn dependency_throw_is_visible_unmodified_at_the_top() {
        let scheduler = failing_engine();
        let session = Session::new();
        let error = scheduler
            .product_request(
                &session,
                TypeKey::of::<Wrapped>(),
                [Params::single(Param::new(Src(1)))],
            )
            .await
            .unwrap_err();

        assert_eq!(error.failures.len(), 1);
        let throw = error.failures[0].error.as_throw().expect("expected a throw");
        // The original error, not a re-rendering of it.
        let tool_error = throw.downcast_ref::<ToolError>().expect("original error type");
        assert_eq!(*tool_error, ToolError { exit_code: 42 });
        // The chain names both failing nodes, innermost first.
        assert!(throw.chain()[0].contains("run_tool"));
        assert!(throw.chain()[1].contains("wrap_tool"));
    }

    #[tokio::test]
    async fn failed_outcomes_are_cached_like_values() {
        let scheduler = failing_engine();
        let session = Session::new();
        for _ in 0..2 {
            let error = scheduler
                .product_request(
                    &session,
                    TypeKey::of::<Wrapped>(),
                    [Params::single(Param::new(Src(9)))],
                )
                .await
                .unwrap_err();
            assert!(error.failures[0].error.as_throw().is_some());
        }
    }
}

mod noop {
    use super::*;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Key(&'static str);
    #[derive(Debug)]
    struct Missing;
    #[derive(Debug, PartialEq)]
    struct Looked(&'static str);

    #[tokio::test]
    async fn absence_is_branchable_not_fatal() {
        let mut registry = Registry::new();
        // No rule produces `Missing`: the Get compiles to a Noop edge.
        registry
            .register(Rule::new(
                "lookup_with_fallback",
                TypeKey::of::<Looked>(),
                vec![
                    DependencyKey::Select(TypeKey::of::<Key>()),
                    DependencyKey::Get {
                        output: TypeKey::of::<Missing>(),
                        input: TypeKey::of::<Key>(),
                    },
                ],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let key = ctx.select::<Key>().await?;
                        match ctx.get_optional::<Missing>(Param::new(Key(key.0))).await? {
                            Some(_) => Ok(Value::new(Looked("present"))),
                            None => Ok(Value::new(Looked("absent"))),
                        }
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(TypeKey::of::<Looked>(), [TypeKey::of::<Key>()])],
        )
        .unwrap();
        let scheduler = Scheduler::new(graph);

        let session = Session::new();
        let values = scheduler
            .product_request(
                &session,
                TypeKey::of::<Looked>(),
                [Params::single(Param::new(Key("lib")))],
            )
            .await
            .unwrap();
        assert_eq!(values[0].downcast::<Looked>().unwrap().0, "absent");
    }

    #[tokio::test]
    async fn unhandled_noop_propagates_distinct_from_throw() {
        let mut registry = Registry::new();
        #[derive(Debug, PartialEq)]
        struct Propagated;
        registry
            .register(Rule::new(
                "lookup_strict",
                TypeKey::of::<Propagated>(),
                vec![
                    DependencyKey::Select(TypeKey::of::<Key>()),
                    DependencyKey::Get {
                        output: TypeKey::of::<Missing>(),
                        input: TypeKey::of::<Key>(),
                    },
                ],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let key = ctx.select::<Key>().await?;
                        let _found = ctx.get::<Missing>(Param::new(Key(key.0))).await?;
                        Ok(Value::new(Propagated))
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(
                TypeKey::of::<Propagated>(),
                [TypeKey::of::<Key>()],
            )],
        )
        .unwrap();
        let scheduler = Scheduler::new(graph);
        let session = Session::new();

        let error = scheduler
            .product_request(
                &session,
                TypeKey::of::<Propagated>(),
                [Params::single(Param::new(Key("lib")))],
            )
            .await
            .unwrap_err();
        let noop = error.failures[0].error.as_noop().expect("expected a noop");
        assert_eq!(noop.product(), TypeKey::of::<Missing>());

        // The same root through optional_product reads as "no value".
        let optional = scheduler
            .optional_product(
                &session,
                TypeKey::of::<Propagated>(),
                Params::single(Param::new(Key("lib"))),
            )
            .await
            .unwrap();
        assert!(optional.is_none());
    }
}

mod cycles {
    use super::*;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Seed(u32);
    #[derive(Debug)]
    struct OutA;
    #[derive(Debug)]
    struct OutB;

    #[tokio::test]
    async fn value_cycles_fail_the_node_instead_of_deadlocking() {
        let mut registry = Registry::new();
        registry
            .register(Rule::new(
                "forward",
                TypeKey::of::<OutA>(),
                vec![
                    DependencyKey::Select(TypeKey::of::<Seed>()),
                    DependencyKey::Get {
                        output: TypeKey::of::<OutB>(),
                        input: TypeKey::of::<Seed>(),
                    },
                ],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let seed = ctx.select::<Seed>().await?;
                        let _b = ctx.get::<OutB>(Param::new(Seed(seed.0))).await?;
                        Ok(Value::new(OutA))
                    })
                }),
            ))
            .unwrap();
        registry
            .register(Rule::new(
                "backward",
                TypeKey::of::<OutB>(),
                vec![
                    DependencyKey::Select(TypeKey::of::<Seed>()),
                    DependencyKey::Get {
                        output: TypeKey::of::<OutA>(),
                        input: TypeKey::of::<Seed>(),
                    },
                ],
                rule_fn(|ctx| {
                    Box::pin(async move {
                        let seed = ctx.select::<Seed>().await?;
                        let _a = ctx.get::<OutA>(Param::new(Seed(seed.0))).await?;
                        Ok(Value::new(OutB))
                    })
                }),
            ))
            .unwrap();
        let graph = RuleGraph::compile(
            &registry,
            vec![RootQuery::new(TypeKey::of::<OutA>(), [TypeKey::of::<Seed>()])],
        )
        .unwrap();
        let scheduler = Scheduler::new(graph);

        let session = Session::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.product_request(
                &session,
                TypeKey::of::<OutA>(),
                [Params::single(Param::new(Seed(1)))],
            ),
        )
        .await
        .expect("cycle deadlocked");
        let error = result.unwrap_err();
        let throw = error.failures[0].error.as_throw().expect("expected a throw");
        assert!(throw.to_string().contains("cycle"));
    }
}
