use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "otb")]
#[command(about = "OT order bridge CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> site -> ...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Production orders
    Order {
        #[command(subcommand)]
        cmd: OrderCmd,
    },

    /// Device simulator
    Device {
        #[command(subcommand)]
        cmd: DeviceCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum OrderCmd {
    /// Queue a new order (status NEW).
    Create {
        #[arg(long)]
        item: String,

        /// Units to produce, 1..=32767
        #[arg(long, allow_negative_numbers = true)]
        qty: i32,

        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// All orders, newest first.
    List {
        /// Print JSON instead of one line per order
        #[arg(long, default_value_t = false)]
        json: bool,

        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// Production log rows of one order.
    Logs {
        #[arg(long)]
        id: i64,

        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DeviceCmd {
    /// Serve the simulated device over Modbus/TCP until ctrl-c.
    Run {
        /// Override device.bind
        #[arg(long)]
        bind: Option<String>,

        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = otb_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = otb_db::status(&pool).await?;
                    println!("db_ok={} has_orders_table={}", s.ok, s.has_orders_table);
                }
                DbCmd::Migrate => {
                    otb_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = otb_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Order { cmd } => match cmd {
            OrderCmd::Create {
                item,
                qty,
                config_paths,
            } => commands::orders::create(&config_paths, &item, qty).await?,
            OrderCmd::List { json, config_paths } => {
                commands::orders::list(&config_paths, json).await?
            }
            OrderCmd::Logs { id, config_paths } => {
                commands::orders::logs(&config_paths, id).await?
            }
        },

        Commands::Device { cmd } => match cmd {
            DeviceCmd::Run { bind, config_paths } => {
                commands::init_tracing();
                commands::device::run(&config_paths, bind).await?
            }
        },
    }

    Ok(())
}
