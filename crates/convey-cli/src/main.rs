mod catalog_cmds;
mod config;
mod run_cmd;
mod status_cmd;
mod sync_cmd;

use clap::{Parser, Subcommand};

use convey_db::pool;

use config::ConveyConfig;

#[derive(Parser)]
#[command(name = "convey", about = "Data integration sync engine")]
struct Cli {
    /// Database URL (overrides CONVEY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a convey config file (no database required)
    Init {
        /// PostgreSQL connection URL for the catalog
        #[arg(long, default_value = "postgresql://localhost:5432/convey")]
        db_url: String,
        /// Warehouse connection URL (defaults to the catalog URL)
        #[arg(long)]
        warehouse_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the catalog database (create + migrate)
    DbInit,
    /// Datasource management
    Datasource {
        #[command(subcommand)]
        command: DatasourceCommands,
    },
    /// Data interface management
    Interface {
        #[command(subcommand)]
        command: InterfaceCommands,
    },
    /// Sync task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Run a single task to completion
    Sync {
        /// Task ID to run
        task_id: String,
    },
    /// Run the engine as a service (with optional scheduler)
    Run {
        /// Maximum number of concurrent sync workers
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
        /// Task queue capacity
        #[arg(long, default_value_t = 1000)]
        queue_size: usize,
        /// Enable the scheduler tick loop (requires Redis for locking)
        #[arg(long)]
        scheduler: bool,
        /// Scheduler tick interval in seconds
        #[arg(long, default_value_t = 30)]
        tick_secs: u64,
    },
    /// Show task status (omit task_id to list active tasks)
    Status {
        /// Task ID to show
        task_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum DatasourceCommands {
    /// Register a datasource
    Add {
        /// Unique datasource name
        name: String,
        /// Kind: database-postgres, api-http, api-http-auth,
        /// messaging-mqtt, messaging-http-post
        #[arg(long)]
        kind: String,
        /// Connection config as inline JSON or @file
        #[arg(long)]
        config: String,
    },
    /// List datasources
    List,
}

#[derive(Subcommand)]
enum InterfaceCommands {
    /// Create a data interface
    Add {
        /// Interface name
        name: String,
        /// Owning datasource ID
        #[arg(long)]
        datasource_id: String,
        /// Target schema
        #[arg(long, default_value = "public")]
        schema: String,
        /// Target table
        #[arg(long)]
        table: String,
        /// Parse config (fieldMapping, request, pagination) as inline JSON or @file
        #[arg(long, default_value = "{}")]
        parse_config: String,
        /// Target column declarations as inline JSON or @file
        #[arg(long, default_value = "[]")]
        fields_config: String,
    },
    /// List interfaces for a datasource
    List {
        /// Datasource ID
        datasource_id: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a sync task
    Create {
        /// Library type: basic or thematic
        #[arg(long, default_value = "basic")]
        library_type: String,
        /// Library ID
        #[arg(long)]
        library_id: String,
        /// Datasource ID
        #[arg(long)]
        datasource_id: String,
        /// Sync type: full, incremental, realtime
        #[arg(long)]
        sync_type: String,
        /// Task config (batch_size, interval_secs, ...) as inline JSON or @file
        #[arg(long, default_value = "{}")]
        config: String,
        /// Comma-separated interface IDs to link
        #[arg(long)]
        interfaces: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            warehouse_url,
            force,
        } => {
            let path = config::write_config(&db_url, warehouse_url.as_deref(), force)?;
            println!("Config written to {}", path.display());
        }
        Commands::DbInit => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            pool::ensure_database_exists(&resolved.db_config).await?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
            db_pool.close().await;
            println!("convey db-init complete.");
        }
        Commands::Datasource { command } => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                DatasourceCommands::Add { name, kind, config } => {
                    catalog_cmds::datasource_add(&db_pool, &name, &kind, &config).await
                }
                DatasourceCommands::List => catalog_cmds::datasource_list(&db_pool).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Interface { command } => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                InterfaceCommands::Add {
                    name,
                    datasource_id,
                    schema,
                    table,
                    parse_config,
                    fields_config,
                } => {
                    catalog_cmds::interface_add(
                        &db_pool,
                        &name,
                        &datasource_id,
                        &schema,
                        &table,
                        &parse_config,
                        &fields_config,
                    )
                    .await
                }
                InterfaceCommands::List { datasource_id } => {
                    catalog_cmds::interface_list(&db_pool, &datasource_id).await
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TaskCommands::Create {
                    library_type,
                    library_id,
                    datasource_id,
                    sync_type,
                    config,
                    interfaces,
                } => {
                    catalog_cmds::task_create(
                        &db_pool,
                        &library_type,
                        &library_id,
                        &datasource_id,
                        &sync_type,
                        &config,
                        &interfaces,
                    )
                    .await
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Sync { task_id } => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            let catalog = pool::create_pool(&resolved.db_config).await?;
            let warehouse = pool::create_warehouse_pool(&resolved.db_config).await?;
            let result = sync_cmd::run_sync(catalog.clone(), warehouse, &task_id).await;
            catalog.close().await;
            result?;
        }
        Commands::Run {
            max_concurrent,
            queue_size,
            scheduler,
            tick_secs,
        } => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            let catalog = pool::create_pool(&resolved.db_config).await?;
            let warehouse = pool::create_warehouse_pool(&resolved.db_config).await?;
            run_cmd::run_service(
                catalog,
                warehouse,
                run_cmd::RunOptions {
                    max_concurrent,
                    queue_size,
                    scheduler,
                    tick_secs,
                },
            )
            .await?;
        }
        Commands::Status { task_id } => {
            let resolved = ConveyConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, task_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
