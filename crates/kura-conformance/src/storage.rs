//! Storage checks: round trips, lifecycle, replay and reconstruction.

use crate::WorldFactory;
use kura_core::{
    CreateRun, EntityKind, EventKind, FailureCause, RunAggregate, RunId, RunStatus, StepEventKind,
    StepId, StepStatus, Storage, Value, WorldError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

async fn running_run(storage: &dyn Storage, workflow: &str) -> RunId {
    let run = storage
        .create_run(CreateRun::new(workflow, Value::Null))
        .await
        .expect("create run");
    storage.start_run(&run.run_id).await.expect("start run");
    run.run_id
}

async fn event_count(storage: &dyn Storage, run_id: &RunId) -> usize {
    storage.list_events(run_id).await.expect("list events").len()
}

fn sample_value() -> Value {
    let mut nested = Value::from("leaf");
    for depth in 0..20i64 {
        nested = Value::map([(
            format!("level{depth}"),
            Value::List(vec![nested, Value::Int(depth)]),
        )]);
    }
    Value::map([
        ("binary", Value::Bytes(vec![0, 159, 146, 150, 0, 255, 0])),
        ("empty_binary", Value::Bytes(Vec::new())),
        ("nul_text", Value::Text("a\0b".to_string())),
        ("unicode", Value::from("データ ✓")),
        ("min", Value::Int(i64::MIN)),
        ("max", Value::Int(i64::MAX)),
        ("float", Value::Float(-0.1)),
        ("flag", Value::Bool(true)),
        ("null", Value::Null),
        ("nested", nested),
    ])
}

/// Inputs, results and failure causes come back byte for byte.
pub async fn value_round_trip(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let value = sample_value();

    let run = storage
        .create_run(CreateRun::new("round_trip", value.clone()))
        .await
        .unwrap();
    assert_eq!(storage.get_run(&run.run_id).await.unwrap().input, value);

    storage.start_run(&run.run_id).await.unwrap();
    let step_id = StepId::new("step_echo");
    storage
        .append_step_event(&run.run_id, &step_id, StepEventKind::Started, value.clone())
        .await
        .unwrap();
    storage
        .append_step_event(&run.run_id, &step_id, StepEventKind::Completed, value.clone())
        .await
        .unwrap();
    let step = storage.get_step(&run.run_id, &step_id).await.unwrap();
    assert_eq!(step.input, value);
    assert_eq!(step.result, Some(value.clone()));

    let events = storage.list_events(&run.run_id).await.unwrap();
    assert!(matches!(
        &events[0].kind,
        EventKind::RunCreated { input, .. } if *input == value
    ));

    let cause = FailureCause::new("boom")
        .with_stack("at step_echo\nat run")
        .with_details(Value::Bytes(vec![0, 0, 1]));
    let failed = storage
        .create_run(CreateRun::new("round_trip", Value::Null))
        .await
        .unwrap();
    storage
        .fail_run(&failed.run_id, cause.clone())
        .await
        .unwrap();
    assert_eq!(
        storage.get_run(&failed.run_id).await.unwrap().error,
        Some(cause)
    );

    let rejected = storage
        .create_run(CreateRun::new("round_trip", Value::Float(f64::INFINITY)))
        .await;
    assert!(matches!(rejected, Err(WorldError::Codec(_))));
}

/// Generated ids are prefixed and increasing; caller ids are unique.
pub async fn create_and_duplicate_create(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;

    let first = storage
        .create_run(CreateRun::new("wf", Value::Null))
        .await
        .unwrap();
    let second = storage
        .create_run(CreateRun::new("wf", Value::Null))
        .await
        .unwrap();
    assert!(first.run_id.as_str().starts_with("wrun_"));
    assert!(first.run_id < second.run_id);
    assert_eq!(first.status, RunStatus::Pending);
    assert_eq!(first.workflow_name, "wf");

    let fixed = CreateRun::new("wf", Value::Int(1)).with_run_id("wrun_fixed");
    storage.create_run(fixed.clone()).await.unwrap();
    let duplicate = storage.create_run(fixed).await;
    assert!(matches!(
        duplicate,
        Err(WorldError::AlreadyExists {
            entity: EntityKind::Run,
            ..
        })
    ));
    // The original survives the rejected duplicate.
    assert_eq!(
        storage.get_run(&RunId::new("wrun_fixed")).await.unwrap().input,
        Value::Int(1)
    );

    let missing = RunId::new("wrun_missing");
    assert!(matches!(
        storage.get_run(&missing).await,
        Err(WorldError::NotFound {
            entity: EntityKind::Run,
            ..
        })
    ));
    assert!(matches!(
        storage
            .append_step_event(&missing, &"step_a".into(), StepEventKind::Started, Value::Null)
            .await,
        Err(WorldError::NotFound { .. })
    ));

    let listed: Vec<RunId> = storage
        .list_runs()
        .await
        .unwrap()
        .into_iter()
        .map(|run| run.run_id)
        .collect();
    assert_eq!(listed.len(), 3);
    assert!(listed.contains(&first.run_id) && listed.contains(&second.run_id));
}

/// pending -> running -> terminal, with replays and conflicts.
pub async fn run_lifecycle(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref(), "lifecycle").await;

    let run = storage.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.started_at.is_some());

    let before = event_count(storage.as_ref(), &run_id).await;
    storage.start_run(&run_id).await.unwrap();
    assert_eq!(event_count(storage.as_ref(), &run_id).await, before);

    let done = storage.complete_run(&run_id, Value::Int(7)).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, Some(Value::Int(7)));
    assert!(done.completed_at.is_some());

    let before = event_count(storage.as_ref(), &run_id).await;
    assert_eq!(
        storage.complete_run(&run_id, Value::Int(7)).await.unwrap(),
        done
    );
    assert_eq!(event_count(storage.as_ref(), &run_id).await, before);

    for result in [
        storage.complete_run(&run_id, Value::Int(8)).await,
        storage.fail_run(&run_id, FailureCause::new("late")).await,
        storage.cancel_run(&run_id).await,
        storage.start_run(&run_id).await,
    ] {
        assert!(
            matches!(result, Err(WorldError::Conflict { .. })),
            "terminal run accepted a transition: {result:?}"
        );
    }

    let cancelled = storage
        .create_run(CreateRun::new("lifecycle", Value::Null))
        .await
        .unwrap();
    let run = storage.cancel_run(&cancelled.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(matches!(
        storage
            .append_step_event(
                &cancelled.run_id,
                &"step_a".into(),
                StepEventKind::Started,
                Value::Null
            )
            .await,
        Err(WorldError::Conflict { .. })
    ));

    let failed = running_run(storage.as_ref(), "lifecycle").await;
    let run = storage
        .fail_run(&failed, FailureCause::new("exploded"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.map(|cause| cause.message), Some("exploded".to_string()));
}

/// A completed step returns its stored result; a different outcome conflicts.
pub async fn step_replay_and_conflict(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref(), "steps").await;
    let step_id = StepId::new("step_fetch");

    let step = storage
        .append_step_event(&run_id, &step_id, StepEventKind::Started, Value::from("url"))
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.index, 0);
    assert_eq!(step.attempt, 1);

    let step = storage
        .append_step_event(&run_id, &step_id, StepEventKind::Retrying, Value::from("timeout"))
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    let step = storage
        .append_step_event(&run_id, &step_id, StepEventKind::Started, Value::from("url"))
        .await
        .unwrap();
    assert_eq!(step.attempt, 2);

    let completed = storage
        .append_step_event(&run_id, &step_id, StepEventKind::Completed, Value::Int(42))
        .await
        .unwrap();
    assert_eq!(completed.status, StepStatus::Completed);
    assert_eq!(completed.result, Some(Value::Int(42)));

    let before = event_count(storage.as_ref(), &run_id).await;
    let replayed = storage
        .append_step_event(&run_id, &step_id, StepEventKind::Completed, Value::Int(42))
        .await
        .unwrap();
    assert_eq!(replayed, completed);
    assert_eq!(event_count(storage.as_ref(), &run_id).await, before);

    for (kind, payload) in [
        (StepEventKind::Completed, Value::Int(43)),
        (StepEventKind::Failed, Value::from("late failure")),
        (StepEventKind::Started, Value::Null),
        (StepEventKind::Retrying, Value::Null),
    ] {
        let result = storage
            .append_step_event(&run_id, &step_id, kind, payload)
            .await;
        assert!(
            matches!(result, Err(WorldError::Conflict { .. })),
            "{kind:?} on a completed step gave {result:?}"
        );
    }
    assert_eq!(event_count(storage.as_ref(), &run_id).await, before);

    assert!(matches!(
        storage
            .append_step_event(&run_id, &"step_unknown".into(), StepEventKind::Completed, Value::Null)
            .await,
        Err(WorldError::NotFound {
            entity: EntityKind::Step,
            ..
        })
    ));
    assert!(matches!(
        storage.get_step(&run_id, &"step_unknown".into()).await,
        Err(WorldError::NotFound { .. })
    ));

    let second = storage
        .append_step_event(&run_id, &"step_store".into(), StepEventKind::Started, Value::Null)
        .await
        .unwrap();
    assert_eq!(second.index, 1);
    let ids: Vec<StepId> = storage
        .list_steps(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|step| step.step_id)
        .collect();
    assert_eq!(ids, vec![step_id, StepId::new("step_store")]);
}

/// 110 steps, some still running, fold identically from any prefix.
pub async fn prefix_consistent_reconstruction(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref(), "wide").await;

    for index in 0..110i64 {
        let step_id = StepId::new(format!("step_{index:03}"));
        storage
            .append_step_event(&run_id, &step_id, StepEventKind::Started, Value::Int(index))
            .await
            .unwrap();
        if index % 3 != 0 {
            storage
                .append_step_event(&run_id, &step_id, StepEventKind::Completed, Value::Int(index * 2))
                .await
                .unwrap();
        }
    }

    let events = storage.list_events(&run_id).await.unwrap();
    let sequences: Vec<u64> = events.iter().map(|event| event.sequence).collect();
    assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());

    let full = RunAggregate::fold(&run_id, &events).unwrap();
    assert_eq!(full, RunAggregate::fold(&run_id, &events).unwrap());
    assert_eq!(full.run(), &storage.get_run(&run_id).await.unwrap());
    assert_eq!(full.steps(), storage.list_steps(&run_id).await.unwrap().as_slice());
    assert_eq!(full.steps().len(), 110);
    assert_eq!(
        full.steps()
            .iter()
            .filter(|step| step.status == StepStatus::Running)
            .count(),
        37
    );

    let mut incremental = RunAggregate::fold(&run_id, &events[..1]).unwrap();
    for end in 2..=events.len() {
        incremental.apply(&events[end - 1]).unwrap();
        let prefix = RunAggregate::fold(&run_id, &events[..end]).unwrap();
        assert_eq!(prefix, incremental, "prefix of {end} events diverged");
        for step in prefix.steps() {
            let final_step = full.step(&step.step_id).unwrap();
            assert_eq!(step.index, final_step.index);
            assert_eq!(step.input, final_step.input);
            if step.status == StepStatus::Completed {
                assert_eq!(step, final_step);
            }
        }
    }
}

/// Concurrent appends to one run never share or skip a sequence.
pub async fn concurrent_appends_are_contiguous(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref(), "concurrent").await;

    let mut tasks = Vec::new();
    for worker in 0..16 {
        let storage = Arc::clone(&storage);
        let run_id = run_id.clone();
        tasks.push(tokio::spawn(async move {
            for index in 0..5 {
                let step_id = StepId::new(format!("step_{worker}_{index}"));
                storage
                    .append_step_event(&run_id, &step_id, StepEventKind::Started, Value::Null)
                    .await
                    .unwrap();
                storage
                    .append_step_event(&run_id, &step_id, StepEventKind::Completed, Value::Int(worker))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let events = storage.list_events(&run_id).await.unwrap();
    assert_eq!(events.len(), 2 + 16 * 5 * 2);
    for (position, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, position as u64 + 1);
    }
    let steps = storage.list_steps(&run_id).await.unwrap();
    assert_eq!(steps.len(), 80);
    assert!(steps.iter().all(|step| step.status == StepStatus::Completed));
    let mut indexes: Vec<u32> = steps.iter().map(|step| step.index).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, (0..80).collect::<Vec<u32>>());
}

/// Readers running alongside writers only ever see whole, growing prefixes.
pub async fn reads_see_consistent_prefix(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let run_id = running_run(storage.as_ref(), "prefix_reads").await;
    let writing = Arc::new(AtomicBool::new(true));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let storage = Arc::clone(&storage);
        let run_id = run_id.clone();
        let writing = Arc::clone(&writing);
        readers.push(tokio::spawn(async move {
            let mut seen_steps = 0;
            let mut seen_events = 0;
            let mut rounds = 0u32;
            while writing.load(Ordering::SeqCst) || rounds == 0 {
                rounds += 1;
                let events = storage.list_events(&run_id).await.unwrap();
                for (position, event) in events.iter().enumerate() {
                    assert_eq!(event.sequence, position as u64 + 1);
                }
                assert!(events.len() >= seen_events, "event history shrank");
                seen_events = events.len();

                let steps = storage.list_steps(&run_id).await.unwrap();
                assert!(steps.len() >= seen_steps, "step count went down");
                for (position, step) in steps.iter().enumerate() {
                    assert_eq!(step.index, position as u32);
                }
                seen_steps = steps.len();

                let run = storage.get_run(&run_id).await.unwrap();
                assert_eq!(run.status, RunStatus::Running);
                tokio::task::yield_now().await;
            }
            rounds
        }));
    }

    let mut writers = Vec::new();
    for worker in 0..4 {
        let storage = Arc::clone(&storage);
        let run_id = run_id.clone();
        writers.push(tokio::spawn(async move {
            for index in 0..15 {
                let step_id = StepId::new(format!("step_{worker}_{index}"));
                storage
                    .append_step_event(&run_id, &step_id, StepEventKind::Started, Value::Null)
                    .await
                    .unwrap();
                storage
                    .append_step_event(&run_id, &step_id, StepEventKind::Completed, Value::Int(index))
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    writing.store(false, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }

    assert_eq!(storage.list_steps(&run_id).await.unwrap().len(), 60);
    assert_eq!(event_count(storage.as_ref(), &run_id).await, 2 + 60 * 2);
}

/// Mutating a returned value never reaches the stored state.
pub async fn reads_return_independent_copies(factory: &dyn WorldFactory) {
    let storage = factory.create_storage().await;
    let input = Value::List(vec![Value::Int(1), Value::Int(2)]);
    let run = storage
        .create_run(CreateRun::new("copies", input.clone()))
        .await
        .unwrap();

    let mut copy = storage.get_run(&run.run_id).await.unwrap();
    copy.input = Value::from("tampered");
    copy.status = RunStatus::Completed;

    let mut events = storage.list_events(&run.run_id).await.unwrap();
    events.clear();

    let stored = storage.get_run(&run.run_id).await.unwrap();
    assert_eq!(stored.input, input);
    assert_eq!(stored.status, RunStatus::Pending);
    assert_eq!(event_count(storage.as_ref(), &run.run_id).await, 1);
}
