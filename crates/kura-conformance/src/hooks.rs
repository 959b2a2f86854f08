//! Hook checks: idempotent settlement and cleanup.

use crate::WorldFactory;
use kura_core::{
    CreateRun, EntityKind, EventKind, HookId, HookStatus, RunId, Storage, Value, WorldError,
};
use std::sync::Arc;

async fn running_run(storage: &dyn Storage) -> RunId {
    let run = storage
        .create_run(CreateRun::new("hooks", Value::Null))
        .await
        .unwrap();
    storage.start_run(&run.run_id).await.unwrap();
    run.run_id
}

fn settlements(events: &[kura_core::Event], hook_id: &HookId) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(
                &event.kind,
                EventKind::HookResolved { hook_id: id, .. } | EventKind::HookCancelled { hook_id: id }
                    if id == hook_id
            )
        })
        .count()
}

/// A retried callback resolves once; later settlements are no-ops.
pub async fn hook_resolution_is_idempotent(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref()).await;
    let hook_id = HookId::new("hook_approval");
    let metadata = Value::map([("token", Value::from("abc"))]);

    let hook = storage
        .register_hook(&run_id, &hook_id, metadata.clone())
        .await
        .unwrap();
    assert_eq!(hook.status, HookStatus::Pending);
    assert_eq!(
        storage
            .register_hook(&run_id, &hook_id, metadata.clone())
            .await
            .unwrap(),
        hook
    );
    assert!(matches!(
        storage.register_hook(&run_id, &hook_id, Value::Null).await,
        Err(WorldError::AlreadyExists {
            entity: EntityKind::Hook,
            ..
        })
    ));

    let resolved = storage
        .resolve_hook(&run_id, &hook_id, Value::from("approved"))
        .await
        .unwrap();
    assert_eq!(resolved.status, HookStatus::Resolved);
    assert_eq!(resolved.payload, Some(Value::from("approved")));

    let again = storage
        .resolve_hook(&run_id, &hook_id, Value::from("rejected"))
        .await
        .unwrap();
    assert_eq!(again, resolved);
    let cancelled = storage.cancel_hook(&run_id, &hook_id).await.unwrap();
    assert_eq!(cancelled, resolved);

    let events = storage.list_events(&run_id).await.unwrap();
    assert_eq!(settlements(&events, &hook_id), 1);

    assert!(matches!(
        storage
            .resolve_hook(&run_id, &"hook_unknown".into(), Value::Null)
            .await,
        Err(WorldError::NotFound {
            entity: EntityKind::Hook,
            ..
        })
    ));
}

/// Cleanup cancels only pending hooks and can run any number of times.
pub async fn cleanup_is_idempotent(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref()).await;
    for name in ["hook_a", "hook_b", "hook_c"] {
        storage
            .register_hook(&run_id, &name.into(), Value::Null)
            .await
            .unwrap();
    }
    storage
        .resolve_hook(&run_id, &"hook_b".into(), Value::Int(1))
        .await
        .unwrap();

    let cancelled: Vec<HookId> = storage
        .cleanup_hooks(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|hook| hook.hook_id)
        .collect();
    assert_eq!(cancelled, vec![HookId::new("hook_a"), HookId::new("hook_c")]);

    let before = storage.list_events(&run_id).await.unwrap().len();
    for _ in 0..3 {
        assert!(storage.cleanup_hooks(&run_id).await.unwrap().is_empty());
    }
    assert_eq!(storage.list_events(&run_id).await.unwrap().len(), before);

    let late = storage
        .resolve_hook(&run_id, &"hook_a".into(), Value::from("late"))
        .await
        .unwrap();
    assert_eq!(late.status, HookStatus::Cancelled);
    assert_eq!(late.payload, None);

    let statuses: Vec<HookStatus> = storage
        .list_hooks(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|hook| hook.status)
        .collect();
    assert_eq!(
        statuses,
        vec![HookStatus::Cancelled, HookStatus::Resolved, HookStatus::Cancelled]
    );
}

/// Racing cleanup and resolution always settles the hook exactly once.
pub async fn cleanup_and_resolve_converge(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    for round in 0..20 {
        let run_id = running_run(storage.as_ref()).await;
        let hook_id = HookId::new(format!("hook_race_{round}"));
        storage
            .register_hook(&run_id, &hook_id, Value::Null)
            .await
            .unwrap();

        let resolve = {
            let storage = Arc::clone(&storage);
            let (run_id, hook_id) = (run_id.clone(), hook_id.clone());
            tokio::spawn(async move {
                storage
                    .resolve_hook(&run_id, &hook_id, Value::Int(round))
                    .await
            })
        };
        let cleanup = {
            let storage = Arc::clone(&storage);
            let run_id = run_id.clone();
            tokio::spawn(async move { storage.cleanup_hooks(&run_id).await })
        };
        resolve.await.unwrap().unwrap();
        cleanup.await.unwrap().unwrap();

        let hook = storage.get_hook(&run_id, &hook_id).await.unwrap();
        assert_ne!(hook.status, HookStatus::Pending);
        let events = storage.list_events(&run_id).await.unwrap();
        assert_eq!(settlements(&events, &hook_id), 1);
    }
}

/// Completing, failing or cancelling a run leaves no pending hook behind.
pub async fn terminal_run_cancels_pending_hooks(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref()).await;
    storage
        .register_hook(&run_id, &"hook_open".into(), Value::Null)
        .await
        .unwrap();
    storage
        .register_hook(&run_id, &"hook_done".into(), Value::Null)
        .await
        .unwrap();
    storage
        .resolve_hook(&run_id, &"hook_done".into(), Value::Bool(true))
        .await
        .unwrap();

    storage
        .complete_run(&run_id, Value::Null)
        .await
        .unwrap();

    let open = storage
        .get_hook(&run_id, &"hook_open".into())
        .await
        .unwrap();
    assert_eq!(open.status, HookStatus::Cancelled);
    let done = storage
        .get_hook(&run_id, &"hook_done".into())
        .await
        .unwrap();
    assert_eq!(done.status, HookStatus::Resolved);
    assert!(storage.cleanup_hooks(&run_id).await.unwrap().is_empty());

    assert!(matches!(
        storage
            .register_hook(&run_id, &"hook_late".into(), Value::Null)
            .await,
        Err(WorldError::Conflict { .. })
    ));

    for cancel in [true, false] {
        let run_id = running_run(storage.as_ref()).await;
        storage
            .register_hook(&run_id, &"hook_open".into(), Value::Null)
            .await
            .unwrap();
        if cancel {
            storage.cancel_run(&run_id).await.unwrap();
        } else {
            storage
                .fail_run(&run_id, kura_core::FailureCause::new("failed"))
                .await
                .unwrap();
        }
        assert_eq!(
            storage
                .get_hook(&run_id, &"hook_open".into())
                .await
                .unwrap()
                .status,
            HookStatus::Cancelled
        );
    }
}
