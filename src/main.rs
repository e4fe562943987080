use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use itinerary_sync::observability::init_observability;
use itinerary_sync::sync::{NewOperation, OperationType, Priority, ResourceKind, TokioClock};
use itinerary_sync::{config, open_queue, run};

#[derive(Parser)]
#[command(name = "itinerary-sync", about = "Offline-first sync engine for itinerary data")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the sync orchestrator until interrupted (default)
	Run,
	/// Queue an operation for the next sync pass
	Enqueue {
		/// create, update, delete or patch
		op_type: OperationType,
		/// trip, participant, activity, document or expense
		resource: ResourceKind,
		/// Remote id of the resource (required except for create)
		#[arg(long)]
		id: Option<String>,
		/// JSON payload
		#[arg(long)]
		data: Option<String>,
		/// Lower is more urgent
		#[arg(long, default_value_t = Priority::NORMAL)]
		priority: i32,
		/// Operation ids that must be delivered first
		#[arg(long = "depends-on")]
		depends_on: Vec<String>,
	},
	/// Print queue statistics as JSON
	Stats,
	/// Remove stale operations
	Cleanup,
	/// Drop every queued operation
	Clear,
	/// Print every queued operation as JSON
	Export,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let settings = config::load().context("failed to load configuration")?;
	let state = init_observability(settings.log_level)?;

	let command = cli.command.unwrap_or(Commands::Run);
	if let Commands::Run = command {
		return run(settings, state.metrics).await;
	}

	let queue = open_queue(&settings, Arc::new(TokioClock::new())).await?;
	match command {
		Commands::Run => {}
		Commands::Enqueue {
			op_type,
			resource,
			id,
			data,
			priority,
			depends_on,
		} => {
			if op_type != OperationType::Create && id.is_none() {
				bail!("--id is required for {} operations", op_type);
			}
			let mut operation = NewOperation::new(op_type, resource).with_priority(priority);
			if let Some(id) = id {
				operation = operation.with_resource_id(id);
			}
			if let Some(data) = data {
				let payload = serde_json::from_str(&data).context("--data must be valid JSON")?;
				operation = operation.with_payload(payload);
			}
			for dependency in depends_on {
				operation = operation.with_dependency(dependency);
			}
			println!("{}", queue.enqueue(operation).await);
		}
		Commands::Stats => {
			println!("{}", serde_json::to_string_pretty(&queue.get_stats().await)?);
		}
		Commands::Cleanup => {
			println!("Removed {} stale operations", queue.cleanup().await);
		}
		Commands::Clear => {
			println!("Removed {} operations", queue.clear().await);
		}
		Commands::Export => {
			println!("{}", serde_json::to_string_pretty(&queue.export().await)?);
		}
	}

	Ok(())
}
