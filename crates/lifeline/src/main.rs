//! `lifeline` - CLI for the lifeline event database
//!
//! This binary inspects what the coordinator recorded on this device: alerts
//! still waiting for a channel, alerts that need manual follow-up, and the
//! armed safety check.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs;

use anyhow::{bail, Context, Result};
use clap::Parser;

use lifeline::cli::{Cli, Command, ConfigCommand, EventsCommand, PruneCommand};
use lifeline::safety::stored_switch;
use lifeline::storage::EventRecord;
use lifeline::{init_logging, Config, EmergencyEvent, EventId, EventStatus, Storage};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Validation reports its own errors
    if let Command::Config(ConfigCommand::Validate { file }) = cli.command {
        validate_config(file.or(cli.config));
        return Ok(());
    }

    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    match cli.command {
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Events(events_cmd) => handle_events(&config, events_cmd),
        Command::Prune(prune_cmd) => handle_prune(&config, &prune_cmd),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

fn open_read_only(config: &Config) -> Result<Storage> {
    let path = config.database_path();
    let storage =
        Storage::open(&path).with_context(|| format!("opening database {}", path.display()))?;
    storage.set_query_only(true)?;
    Ok(storage)
}

fn handle_status(config: &Config, json: bool) -> Result<()> {
    let storage = open_read_only(config)?;
    let stats = storage.stats()?;
    let in_flight = storage.events_by_status(EventStatus::Dispatching)?;
    let safety = stored_switch(&storage)?;

    if json {
        let status = serde_json::json!({
            "database_path": storage.path(),
            "stats": stats,
            "in_flight": in_flight,
            "safety_check": safety,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("lifeline status");
    println!("---------------");
    println!("Database:      {}", storage.path().display());
    println!("Size:          {} bytes", stats.db_size_bytes);
    println!("Events:        {}", stats.total_events);
    for (status, count) in &stats.by_status {
        if *count > 0 {
            println!("  {:<12} {count}", status.to_string());
        }
    }
    println!();

    match safety {
        Some(switch) => {
            println!("Safety check:  armed ({})", switch.reason);
            println!("  Handle:      {}", switch.handle);
            println!("  Deadline:    {}", switch.deadline_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => println!("Safety check:  not armed"),
    }

    if !in_flight.is_empty() {
        println!();
        println!("Waiting for delivery:");
        for event in &in_flight {
            println!("  {}", summary_line(event));
        }
    }

    let abandoned = stats.count_for(EventStatus::Abandoned);
    if abandoned > 0 {
        println!();
        println!("{abandoned} event(s) could not be delivered and need manual follow-up.");
        println!("Run `lifeline events list --status abandoned` to review them.");
    }
    Ok(())
}

fn handle_events(config: &Config, cmd: EventsCommand) -> Result<()> {
    let storage = open_read_only(config)?;

    match cmd {
        EventsCommand::List {
            status,
            limit,
            json,
        } => {
            let events = match status {
                Some(status) => {
                    // Stored oldest first
                    let mut events = storage.events_by_status(status.into())?;
                    events.reverse();
                    events.truncate(limit);
                    events
                }
                None => storage.recent(limit)?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No events recorded.");
            } else {
                println!(
                    "{:<8}  {:<11}  {:<14}  {:<19}  CHANNELS",
                    "ID", "STATUS", "SOURCE", "CREATED"
                );
                for event in &events {
                    println!("{}", summary_line(event));
                }
            }
        }
        EventsCommand::Show { id, json } => {
            let id = resolve_event_id(&storage, &id)?;
            let event = storage
                .get_event(&id)?
                .with_context(|| format!("event {id} disappeared"))?;
            let log = storage.log_for(&id)?;

            if json {
                let record = EventRecord { event, log };
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_event(&event);
                println!();
                println!("Log:");
                for entry in &log {
                    println!(
                        "  {}  {:<5}  {:<10}  {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.level,
                        entry.action,
                        entry.message
                    );
                }
            }
        }
        EventsCommand::Export { output, limit } => {
            let records = storage.export(limit)?;
            let json = serde_json::to_string_pretty(&records)?;
            match output {
                Some(path) => {
                    fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Exported {} event(s) to {}", records.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
    }
    Ok(())
}

fn resolve_event_id(storage: &Storage, prefix: &str) -> Result<EventId> {
    let matches = storage.find_ids_by_prefix(prefix, 2)?;
    match matches.as_slice() {
        [] => bail!("no event matches '{prefix}'"),
        [id] => Ok(id.clone()),
        _ => bail!("'{prefix}' matches more than one event, use a longer prefix"),
    }
}

fn handle_prune(config: &Config, cmd: &PruneCommand) -> Result<()> {
    let max_age = match (cmd.days, config.retention()) {
        (Some(days), _) => chrono::Duration::days(i64::from(days)),
        (None, Some(retention)) => chrono::Duration::from_std(retention)
            .context("retention period out of range")?,
        (None, None) => {
            println!("Retention is disabled (storage.retention_days = 0).");
            println!("Pass --days to prune anyway.");
            return Ok(());
        }
    };

    let path = config.database_path();
    let storage =
        Storage::open(&path).with_context(|| format!("opening database {}", path.display()))?;
    let pruned = storage.prune_older_than(max_age)?;
    println!("Pruned {pruned} finished event(s) older than {} day(s).", max_age.num_days());
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print_config(config);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => validate_config(file),
    }
    Ok(())
}

fn validate_config(file: Option<std::path::PathBuf>) {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => println!("Configuration is valid."),
        Err(e) => println!("Configuration error: {e}"),
    }
}

fn print_config(config: &Config) {
    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Storage]");
    println!("  Database path:      {}", config.database_path().display());
    println!("  Retention (days):   {}", config.storage.retention_days);
    println!();
    println!("[Detector]");
    println!("  Impact (m/s²):      {}", config.detector.impact_threshold);
    println!("  Sustained (m/s²):   {}", config.detector.sustained_threshold);
    println!("  Window:             {}", config.detector.window_size);
    println!();
    println!("[Coordinator]");
    println!("  Crash countdown:    {}s", config.coordinator.crash_countdown_secs);
    println!("  Manual countdown:   {}s", config.coordinator.manual_countdown_secs);
    println!("  Location timeout:   {}ms", config.coordinator.location_timeout_ms);
    println!("  Repeat crash:       {:?}", config.coordinator.repeat_crash_policy);
    println!();
    println!("[Queue]");
    println!("  Max attempts:       {}", config.queue.max_attempts);
    println!(
        "  Backoff:            {}s to {}s",
        config.queue.backoff_base_secs, config.queue.backoff_max_secs
    );
    println!();
    println!("[Channels]");
    println!(
        "  Voice:              {} ({} number(s))",
        enabled(config.channels.voice.enabled),
        config.channels.voice.emergency_numbers.len()
    );
    println!(
        "  Data push:          {} ({})",
        enabled(config.channels.data_push.enabled),
        config.channels.data_push.endpoint.as_deref().unwrap_or("no endpoint")
    );
    println!("  Satellite:          {}", enabled(config.channels.satellite.enabled));
}

fn enabled(on: bool) -> &'static str {
    if on {
        "enabled"
    } else {
        "disabled"
    }
}

fn summary_line(event: &EmergencyEvent) -> String {
    let channels = event
        .channels
        .iter()
        .map(|(kind, state)| format!("{kind}={}", state.result.label()))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{:<8}  {:<11}  {:<14}  {}  {}",
        short_id(&event.id),
        event.status.to_string(),
        event.source.to_string(),
        event.created_at.format("%Y-%m-%d %H:%M:%S"),
        channels
    )
}

fn short_id(id: &EventId) -> &str {
    id.as_str().get(..8).unwrap_or(id.as_str())
}

fn print_event(event: &EmergencyEvent) {
    let snapshot = event.snapshot();
    println!("Event {}", event.id);
    println!("  Status:         {}", event.status);
    println!("  Source:         {}", event.source);
    println!("  Created:        {}", event.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    match event.location {
        Some(location) => println!("  Location:       {location}"),
        None => println!("  Location:       unknown"),
    }
    if event.merged_signals > 0 {
        println!("  Merged signals: {}", event.merged_signals);
    }
    println!(
        "  Snapshot:       {} samples, battery {}, {}",
        snapshot.recent_samples.len(),
        snapshot
            .battery_level
            .map_or_else(|| "unknown".to_string(), |level| format!("{level}%")),
        if event.snapshot_intact() {
            "intact"
        } else {
            "DIGEST MISMATCH"
        }
    );
    if let Some(device) = &snapshot.device_id {
        println!("  Device:         {device}");
    }

    println!();
    println!("Channels:");
    if event.channels.is_empty() {
        println!("  (none attempted)");
    }
    for (kind, state) in &event.channels {
        let next = state
            .next_attempt_at
            .map(|at| format!(", next {}", at.format("%H:%M:%S")))
            .unwrap_or_default();
        println!(
            "  {:<10} {} after {} attempt(s){next}",
            kind.to_string(),
            state.result,
            state.attempts
        );
    }

    if event.status == EventStatus::Abandoned {
        println!();
        println!("This event was not delivered. Contact the emergency services manually.");
    }
}
