// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic lead-sync usage example.
//!
//! Demonstrates:
//! 1. Wiring an engine around an in-memory CRM
//! 2. Handling a sequence of campaign events for a few leads
//! 3. Protection, priority and idempotent replays
//! 4. Transient CRM failures retried, permanent ones flagged for follow-up
//! 5. Streaming events through `run()`
//! 6. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use lead_sync::{
    CrmError, EventType, HandleOptions, InMemoryCrm, InboundEvent, MemoryLeadActions, StatusKey, SyncConfig,
    SyncEngine,
};
use lead_sync::storage::{MemoryLeadStore, MemoryOutcomeStore};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "lead_sync=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             lead-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Wire the engine
    // ─────────────────────────────────────────────────────────────────────────
    let config = SyncConfig::from_toml_str(
        r#"
        breaker_failure_threshold = 3
        breaker_cooldown_ms = 5000
        call_timeout_ms = 2000

        [retry_overrides.server_error]
        base_delay_ms = 50
        max_delay_ms = 200
        "#,
    )?;

    let crm = Arc::new(InMemoryCrm::new());
    let leads = Arc::new(MemoryLeadStore::new());
    let outcomes = Arc::new(MemoryOutcomeStore::new());
    let actions = Arc::new(MemoryLeadActions::new());
    let (follow_tx, mut follow_rx) = mpsc::unbounded_channel();

    let engine = Arc::new(
        SyncEngine::builder(crm.clone())
            .config(config)
            .lead_store(leads.clone())
            .outcome_store(outcomes.clone())
            .actions(actions.clone())
            .follow_ups(follow_tx)
            .build(),
    );
    println!("📦 Engine built. State: {}", engine.state());

    let model = engine.model().clone();
    leads.insert("alice", model.id_of(StatusKey::InCampaign));
    leads.insert("carol", model.id_of(StatusKey::Customer));

    // ─────────────────────────────────────────────────────────────────────────
    // 2-3. Individual events
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Handling events...");
    let script = [
        ("alice", EventType::ReplyReceived),
        ("alice", EventType::ReplyReceived),
        ("alice", EventType::CampaignCompleted),
        ("carol", EventType::Unsubscribed),
        ("dave", EventType::EmailOpened),
    ];
    for (lead, event_type) in script {
        let outcome = engine.handle(&InboundEvent::new(lead, event_type), HandleOptions::default()).await?;
        println!(
            "   └─ {lead:<6} {:<20} → {:<8} {}",
            event_type.as_str(),
            outcome.disposition(),
            outcome.skip_reason.map(|r| r.to_string()).unwrap_or_default()
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Failures
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚠️  Injecting CRM failures...");
    crm.fail_next(CrmError::Server { status: 503, message: "maintenance".into() });
    let outcome = engine
        .handle(&InboundEvent::new("erin", EventType::Interested), HandleOptions::default())
        .await?;
    println!(
        "   └─ transient 503: {} after {} failed attempt(s)",
        outcome.disposition(),
        outcome.retry_attempts.len()
    );

    crm.fail_lead("frank", CrmError::Rejected { status: 422, message: "lead archived".into() });
    let outcome = engine
        .handle(&InboundEvent::new("frank", EventType::MeetingBooked), HandleOptions::default())
        .await?;
    println!("   └─ permanent 422: {} (needs_follow_up = {})", outcome.disposition(), outcome.needs_follow_up);
    if let Ok(flagged) = follow_rx.try_recv() {
        println!("   └─ follow-up queued for lead '{}'", flagged.lead_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Event stream
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚀 Streaming 30 events through run()...");
    let (tx, rx) = mpsc::channel(64);
    let runner = tokio::spawn(Arc::clone(&engine).run(rx));
    for i in 0..10 {
        let lead = format!("stream-{i}");
        for event_type in [EventType::LeadEnrolled, EventType::EmailSent, EventType::ReplyReceived] {
            tx.send(InboundEvent::new(lead.as_str(), event_type)).await?;
        }
    }
    drop(tx);
    let stats = tokio::time::timeout(Duration::from_secs(10), runner).await??;
    println!(
        "   └─ received {} · applied {} · skipped {} · follow-ups {} · errors {}",
        stats.received, stats.applied, stats.skipped, stats.follow_ups, stats.errors
    );
    println!("   └─ State: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Results
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Results:");
    println!("   ┌─ Outcomes recorded: {}", outcomes.len());
    println!("   ├─ Pending follow-ups: {}", engine.pending_follow_ups(10).await?.len());
    println!("   ├─ Suppressed leads: {}", actions.count(lead_sync::SideEffect::Suppress));
    println!("   └─ CRM writes: {}", crm.set_calls());

    let health = engine.health_check().await;
    println!("\n🩺 Health: {}", serde_json::to_string(&health)?);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump captured metrics sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();
    for line in lines {
        println!("   └─ {line}");
    }
}
