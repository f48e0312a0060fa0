// SPDX-License-Identifier: MIT

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use flowbench::core::scripted::ScriptedSessionFactory;
use flowbench::flow::events::{FlowEvent, FlowEventKind};
use flowbench::flow::graph::FlowExecutor;
use flowbench::flow::server;
use flowbench::flow::workflow::{FlowGraphBuilder, FlowLoader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a flow definition without running it
    Validate {
        /// Structure document (nodes and output ports)
        #[arg(short, long)]
        structure: PathBuf,

        /// Flows document (experiment parameters per key)
        #[arg(short, long)]
        flows: PathBuf,

        /// Parameter overrides merged over the flows document
        #[arg(short, long)]
        overrides: Option<PathBuf>,
    },
    /// Dry-run a flow against a scripted session
    Run {
        #[arg(short, long)]
        structure: PathBuf,

        #[arg(short, long)]
        flows: PathBuf,

        #[arg(short, long)]
        overrides: Option<PathBuf>,

        /// Script book: configuration key to iteration statuses
        #[arg(long)]
        script: PathBuf,

        /// Engine settings (hop limit, wait timeout)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Write the termination report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Write the execution log as text
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Start the HTTP server
    Serve {
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Validate {
            structure,
            flows,
            overrides,
        } => {
            let definition =
                FlowLoader::new().load_definition(&structure, &flows, overrides.as_ref(), None)?;
            let graph = FlowGraphBuilder::from_definition(&definition).build()?;
            println!(
                "Flow is valid: {} node(s) reachable from the start node",
                graph.len()
            );
        }
        Commands::Run {
            structure,
            flows,
            overrides,
            script,
            settings,
            report,
            log: log_path,
        } => {
            let definition = FlowLoader::new().load_definition(
                &structure,
                &flows,
                overrides.as_ref(),
                settings.as_ref(),
            )?;
            let graph = FlowGraphBuilder::from_definition(&definition).build()?;
            let factory = ScriptedSessionFactory::from_file(&script)
                .with_context(|| format!("Failed to load script book {}", script.display()))?;

            let (tx, mut rx) = mpsc::unbounded_channel::<FlowEvent>();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let FlowEventKind::StatusUpdate { message } = &event.kind {
                        println!("{}", message);
                    }
                }
            });

            let executor = FlowExecutor::new(Arc::new(graph), Arc::new(factory))
                .with_settings(definition.settings.clone())
                .with_observer(tx);
            let state = executor.execution_state();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupt received, cancelling flow");
                    state.cancel();
                }
            });

            let executor = executor.spawn().await.context("Flow task failed")?;
            let termination = executor
                .report()
                .cloned()
                .context("Flow finished without a report")?;
            let execution_log = executor.execution_log();
            drop(executor);
            printer.await.ok();

            let json = serde_json::to_string_pretty(&termination)?;
            println!("{}", json);
            if let Some(path) = report {
                std::fs::write(&path, &json)
                    .with_context(|| format!("Failed to write report {}", path.display()))?;
            }
            if let Some(path) = log_path {
                std::fs::write(&path, execution_log.to_string())
                    .with_context(|| format!("Failed to write log {}", path.display()))?;
            }
        }
        Commands::Serve { port } => {
            server::serve(port)
                .await
                .map_err(|e| anyhow::anyhow!("Server failed: {}", e))?;
        }
    }

    Ok(())
}
