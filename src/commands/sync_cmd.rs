//! Sync CLI commands.

use clap::{Args, Subcommand};
use tokio::sync::broadcast;

use scrawl_core::{RealtimeChannel, SyncEvent};

use crate::commands::{build_engine, short};
use crate::config::Config;

/// Sync with the remote store
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and queue state
    Status,
    /// Keep syncing until interrupted, with live change notifications
    Watch,
}

impl SyncCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        match &self.command {
            None => rt.block_on(self.sync(config)),
            Some(SyncSubcommand::Status) => rt.block_on(self.status(config)),
            Some(SyncSubcommand::Watch) => rt.block_on(self.watch(config)),
        }
    }

    /// One-shot drain of the offline queue.
    async fn sync(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            print_not_configured();
            return Ok(());
        }
        let engine = build_engine(config).await?;

        println!(
            "Syncing with {}...",
            config.sync.server_url.as_deref().unwrap_or_default()
        );
        let report = engine.force_sync().await?;

        if report == Default::default() {
            println!("Already up to date.");
            return Ok(());
        }
        if report.completed > 0 {
            println!("  ✓ {} delivered", report.completed);
        }
        if report.conflicts > 0 {
            println!("  ⚡ {} conflicts resolved", report.conflicts);
        }
        if report.failed > 0 {
            println!("  ✗ {} failed (see 'scrawl sync status')", report.failed);
        }
        if report.remaining > 0 {
            println!("  … {} still pending", report.remaining);
        }
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        if !config.sync.is_configured() {
            print_not_configured();
            return Ok(());
        }

        println!(
            "Server:    {}",
            config.sync.server_url.as_deref().unwrap_or_default()
        );
        println!("Strategy:  {}", config.sync.conflict_strategy);
        println!(
            "Resolve:   {}",
            if config.sync.auto_resolve {
                "automatic"
            } else {
                "ask"
            }
        );
        println!();

        let engine = build_engine(config).await?;
        let status = engine.get_status()?;
        println!("Pending:   {}", status.pending);
        println!("Failed:    {}", status.failed);

        for item in engine.pending_items()? {
            println!(
                "  … {} {} ({} attempt{})",
                item.operation,
                item.payload.title,
                item.attempts,
                if item.attempts == 1 { "" } else { "s" }
            );
        }
        for item in engine.failed_items()? {
            println!(
                "  ✗ {} {} - {}",
                item.operation,
                item.payload.title,
                item.last_error.unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Long-running mode: realtime channel plus periodic drains.
    async fn watch(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            print_not_configured();
            return Ok(());
        }
        let engine = build_engine(config).await?;
        let server_url = config.sync.server_url.clone().unwrap_or_default();

        let (channel, channel_events) = RealtimeChannel::connect(&server_url, &config.sync);
        engine.clone().attach_channel(&channel, channel_events);
        for doc in engine.documents()? {
            channel.subscribe(&doc.id)?;
        }
        engine.clone().start();

        println!("Watching for changes (Ctrl-C to stop)...");
        let mut events = engine.subscribe_events();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        print_event(&event);
                        if let SyncEvent::Synced { document_id, .. } = &event {
                            // Announce the delivered change and make sure
                            // freshly created documents get notifications.
                            if let Some(doc) = engine.document(document_id)? {
                                channel.subscribe(&doc.id)?;
                                channel.publish_change(doc)?;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        channel.shutdown();
        engine.stop();
        println!("Stopped.");
        Ok(())
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Synced {
            document_id,
            operation,
        } => println!("  ✓ {} {}", operation, short(document_id)),
        SyncEvent::Conflict {
            document_id,
            action,
            reason,
        } => println!("  ⚡ conflict on {}: {} ({})", short(document_id), action, reason),
        SyncEvent::Error {
            document_id,
            message,
        } => println!("  ✗ {}: {}", short(document_id), message),
        SyncEvent::RemoteUpdated { document_id } => {
            println!("  ↓ updated {}", short(document_id))
        }
        SyncEvent::RemoteDeleted { document_id } => {
            println!("  ↓ deleted {}", short(document_id))
        }
        SyncEvent::Online => println!("  online"),
        SyncEvent::Offline => println!("  offline"),
    }
}

fn print_not_configured() {
    println!("Status: Not configured");
    println!();
    println!("To enable sync, add to your config file:");
    println!();
    println!("  sync:");
    println!("    server_url: \"http://localhost:8080\"");
    println!();
    println!("Or set environment variable:");
    println!("  SCRAWL_SYNC_URL");
}
