//! Records a small workflow run against a world and tails its output stream.
//!
//! Set `KURA_BACKEND=sqlite` (and optionally `KURA_SQLITE_PATH`) to persist it.

use async_trait::async_trait;
use kura::prelude::*;
use std::sync::Arc;

/// Prints callbacks instead of sending them.
struct PrintDelivery;

#[async_trait]
impl Delivery for PrintDelivery {
    async fn deliver(&self, item: &QueueItem) -> kura::Result<()> {
        println!("callback {} -> {}: {:?}", item.id, item.target, item.payload);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = WorldConfig::from_env()?;
    let world = World::create(&config, Arc::new(PrintDelivery))?;

    let run = world
        .storage
        .create_run(CreateRun::new("report", Value::from("2026-Q3")))
        .await?;
    world.storage.start_run(&run.run_id).await?;
    let output = format!("{}/stdout", run.run_id);

    let tail = world.streamer.read_from_stream(&output).await?;
    let tail = tokio::spawn(tail.read_to_end());

    for (step, rows) in [("step_fetch", 120), ("step_aggregate", 12)] {
        let step_id = StepId::new(step);
        world
            .storage
            .append_step_event(&run.run_id, &step_id, StepEventKind::Started, Value::Null)
            .await?;
        world
            .streamer
            .write_to_stream(&output, &run.run_id, format!("{step}: {rows} rows\n").into())
            .await?;
        world
            .storage
            .append_step_event(&run.run_id, &step_id, StepEventKind::Completed, Value::Int(rows))
            .await?;
    }

    let hook_id = HookId::generate()?;
    world
        .storage
        .register_hook(&run.run_id, &hook_id, Value::from("publish approval"))
        .await?;
    world.queue.start().await?;
    world
        .queue
        .enqueue(QueueItem::new(format!("hooks/{hook_id}"), Value::from("approve?"))?)
        .await?;
    world
        .storage
        .resolve_hook(&run.run_id, &hook_id, Value::Bool(true))
        .await?;

    world.streamer.close_stream(&output, &run.run_id).await?;
    let run = world
        .storage
        .complete_run(&run.run_id, Value::from("published"))
        .await?;
    world.queue.wait_idle().await;

    println!("--- {} ---", output);
    print!("{}", String::from_utf8_lossy(&tail.await??));
    println!("run {} is {}", run.run_id, run.status);
    for step in world.storage.list_steps(&run.run_id).await? {
        println!("  #{} {} {} (attempt {})", step.index, step.step_id, step.status, step.attempt);
    }
    Ok(())
}
