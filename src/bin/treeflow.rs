use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use treeflow::EngineConfig;
use treeflow::storage::{InMemoryTaskStore, load_tasks_from_yaml};
use treeflow::tree::context::SharedContext;
use treeflow::tree::executor::{Executor, InMemoryExecutorRegistry};
use treeflow::tree::node::TaskNodeSnapshot;
use treeflow::tree::TaskTreeService;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (YAML). TREEFLOW_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rehydrate task trees from a YAML file of persisted rows and print the recovery report
    Recover {
        /// Path to the persisted task rows
        #[arg(long)]
        tasks: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

/// Stands in for executors referenced by persisted rows; only logs lifecycle hooks.
#[derive(Debug)]
struct InspectExecutor {
    name: String,
}

impl Executor for InspectExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&self, node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        info!(node_id = %node.id, executor = %self.name, "on_start");
        Ok(())
    }

    fn runs_work(&self) -> bool {
        false
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match &cli.command {
        Commands::Recover { tasks } => {
            info!("Loading persisted tasks from: {:?}", tasks);
            let rows = load_tasks_from_yaml(tasks)?;
            info!("Loaded {} rows", rows.len());

            let executors = Arc::new(InMemoryExecutorRegistry::new());
            let names: BTreeSet<String> = rows.iter().filter_map(|r| r.executor_name.clone()).collect();
            for name in names {
                executors.register(Arc::new(InspectExecutor { name }));
            }

            let service = TaskTreeService::builder()
                .config(config.tree)
                .executors(executors)
                .build();
            let store = InMemoryTaskStore::with_rows(rows);
            let report = service.recover(&store).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            info!(
                cached = service.cached_count(),
                live = service.live_count(),
                "Recovery complete"
            );
        }
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
