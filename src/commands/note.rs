//! Note CLI commands.
//!
//! All mutations go through the sync engine: the local cache is updated
//! immediately and the change is delivered to the server when online, or
//! queued silently when not.

use clap::{Args, Subcommand, ValueEnum};

use scrawl_core::{Document, SyncCoordinator, SyncOperation, SyncReceipt};

use crate::commands::{build_engine, short};
use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct NoteCommand {
    #[command(subcommand)]
    pub command: NoteSubcommand,
}

#[derive(Subcommand)]
pub enum NoteSubcommand {
    /// Create a new note
    Add {
        /// Note title
        title: String,

        /// Markdown body
        #[arg(long, short, default_value = "")]
        content: String,
    },

    /// List notes
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a note
    Show {
        /// Note ID (or unique prefix)
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Edit a note's title or content
    Edit {
        /// Note ID (or unique prefix)
        id: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// New markdown body
        #[arg(long, short)]
        content: Option<String>,
    },

    /// Delete a note
    Rm {
        /// Note ID (or unique prefix)
        id: String,
    },
}

impl NoteCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.execute(config))
    }

    async fn execute(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let engine = build_engine(config).await?;

        match &self.command {
            NoteSubcommand::Add { title, content } => {
                let doc = Document::new(title, content);
                let id = doc.id.clone();
                let receipt = engine.sync_document(SyncOperation::Create, doc).await?;
                println!("Created note {}", id);
                print_receipt(&receipt);
            }

            NoteSubcommand::List { format } => {
                let mut docs = engine.documents()?;
                docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&docs)?);
                    }
                    OutputFormat::Text => {
                        if docs.is_empty() {
                            println!("No notes yet. Create one with 'scrawl note add'.");
                        }
                        for doc in docs {
                            println!(
                                "{}  {}  {}",
                                short(&doc.id),
                                doc.updated_at.format("%Y-%m-%d %H:%M"),
                                doc.title
                            );
                        }
                    }
                }
            }

            NoteSubcommand::Show { id, format } => {
                let doc = find_note(&engine, id)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&doc)?);
                    }
                    OutputFormat::Text => {
                        println!("# {}", doc.title);
                        println!();
                        println!("{}", doc.content);
                    }
                }
            }

            NoteSubcommand::Edit { id, title, content } => {
                if title.is_none() && content.is_none() {
                    return Err("nothing to change: pass --title and/or --content".into());
                }
                let mut doc = find_note(&engine, id)?;
                if let Some(title) = title {
                    doc.title = title.clone();
                }
                if let Some(content) = content {
                    doc.content = content.clone();
                }
                doc.updated_at = chrono::Utc::now();
                let receipt = engine.sync_document(SyncOperation::Update, doc).await?;
                println!("Updated note");
                print_receipt(&receipt);
            }

            NoteSubcommand::Rm { id } => {
                let doc = find_note(&engine, id)?;
                let receipt = engine.sync_document(SyncOperation::Delete, doc).await?;
                println!("Deleted note");
                print_receipt(&receipt);
            }
        }
        Ok(())
    }
}

fn print_receipt(receipt: &SyncReceipt) {
    if receipt.delivered {
        println!("  ✓ synced");
    } else {
        println!("  queued for sync");
    }
}

/// Finds a note by full ID or unique prefix.
fn find_note(
    engine: &SyncCoordinator,
    id: &str,
) -> Result<Document, Box<dyn std::error::Error>> {
    if let Some(doc) = engine.document(id)? {
        return Ok(doc);
    }
    let matches: Vec<Document> = engine
        .documents()?
        .into_iter()
        .filter(|d| d.id.starts_with(id))
        .collect();
    match matches.len() {
        0 => Err(format!("no note matches '{}'", id).into()),
        1 => Ok(matches.into_iter().next().unwrap()),
        n => Err(format!("'{}' is ambiguous ({} notes match)", id, n).into()),
    }
}
