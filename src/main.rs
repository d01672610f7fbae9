use clap::{Parser, Subcommand};
use energymeter::{Config, ConnectionConfig, MeterClient, MeterConfig, MeterError, Parity, RegisterCatalog};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "energymeter")]
#[command(about = "Read electricity meters over Modbus RTU and TCP", long_about = None)]
struct Cli {
    /// Directory with additional register definitions (*.yaml)
    #[arg(short, long, global = true)]
    definitions: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the known meter models
    Models,

    /// List the registers of a meter model
    Registers {
        model: String,
    },

    /// Read one meter and print the values as JSON
    Read {
        /// Meter model, e.g. ABB, ABB-B23, SMA, Multicube
        #[arg(short, long)]
        model: String,

        /// Serial port of a Modbus RTU meter
        #[arg(short, long, conflicts_with = "host", required_unless_present = "host")]
        serial: Option<String>,

        #[arg(short, long)]
        baudrate: Option<u32>,

        /// none, even or odd
        #[arg(long, default_value = "none", value_parser = parse_parity)]
        parity: Parity,

        /// Host of a Modbus TCP meter
        #[arg(short = 'H', long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        slave_id: Option<u8>,

        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Skip reading the scale registers of meters which have them
        #[arg(long)]
        no_auto_scale: bool,

        /// Fields to read, every register of the model if none given
        fields: Vec<String>,
    },

    /// Read the meters of a config file
    Poll {
        /// Config file, config/energymeter.yaml or energymeter.yaml if not given
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only read this meter
        #[arg(short, long)]
        meter: Option<String>,
    },
}

fn parse_parity(s: &str) -> Result<Parity, String> {
    match s.to_lowercase().as_str() {
        "none" | "n" => Ok(Parity::None),
        "even" | "e" => Ok(Parity::Even),
        "odd" | "o" => Ok(Parity::Odd),
        _ => Err(format!("unknown parity {s}, use none, even or odd")),
    }
}

fn load_catalog(base: RegisterCatalog, dir: Option<&PathBuf>) -> Result<RegisterCatalog, MeterError> {
    let mut catalog = base;
    if let Some(dir) = dir {
        let count = catalog.load_dir(dir)?;
        info!("Loaded {count} register tables from {}", dir.display());
    }
    Ok(catalog)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), MeterError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| MeterError::config(format!("Unable to encode result: {e}")))?;
    println!("{out}");
    Ok(())
}

fn list_models(catalog: &RegisterCatalog) {
    for table in catalog.tables() {
        println!(
            "{:<16} {:<12} {:?} {:>4} registers",
            table.model(),
            table.manufacturer(),
            table.transport(),
            table.len()
        );
    }
}

fn list_registers(catalog: &RegisterCatalog, model: &str) -> Result<(), MeterError> {
    let table = catalog.get(model)?;
    for reg in table.registers() {
        println!(
            "{:<32} {:>6} {:>2} {:<10} {:>8} {}",
            reg.name,
            reg.address,
            reg.length,
            reg.data_type,
            reg.scale,
            reg.unit.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn read_meter(catalog: &RegisterCatalog, meter: &MeterConfig) -> Result<energymeter::Readings, MeterError> {
    let mut client = MeterClient::open_with_catalog(meter, catalog)?;
    client.connect()?;
    return client.read_all();
}

fn run(cli: Cli) -> Result<(), MeterError> {
    match cli.command {
        Commands::Models => {
            let catalog = load_catalog(RegisterCatalog::builtin().clone(), cli.definitions.as_ref())?;
            list_models(&catalog);
        }
        Commands::Registers { model } => {
            let catalog = load_catalog(RegisterCatalog::builtin().clone(), cli.definitions.as_ref())?;
            list_registers(&catalog, &model)?;
        }
        Commands::Read { model, serial, baudrate, parity, host, port, slave_id, timeout_ms, no_auto_scale, fields } => {
            let catalog = load_catalog(RegisterCatalog::builtin().clone(), cli.definitions.as_ref())?;

            let connection = match (serial, host) {
                (Some(port), _) => ConnectionConfig::Rtu { port, baudrate, parity, timeout_ms },
                (None, Some(host)) => ConnectionConfig::Tcp { host, port, timeout_ms },
                (None, None) => return Err(MeterError::config("Either --serial or --host is needed")),
            };
            let meter = MeterConfig {
                name: model.clone(),
                model,
                slave_id,
                auto_scale: !no_auto_scale,
                fields,
                connection,
            };
            let readings = read_meter(&catalog, &meter)?;
            print_json(&readings)?;
        }
        Commands::Poll { config, meter } => {
            let config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::find()?,
            };
            let catalog = load_catalog(config.catalog()?, cli.definitions.as_ref())?;

            let meters: Vec<&MeterConfig> = match meter.as_ref() {
                Some(name) => vec![config.meter(name)?],
                None => config.meters.iter().collect(),
            };
            if meters.is_empty() {
                return Err(MeterError::config("No meters configured"));
            }

            let mut result = serde_json::Map::new();
            for m in meters {
                let readings = read_meter(&catalog, m)?;
                let value = serde_json::to_value(&readings)
                    .map_err(|e| MeterError::config(format!("Unable to encode result: {e}")))?;
                result.insert(m.name.clone(), value);
            }
            print_json(&result)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("ENERGYMETER_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
